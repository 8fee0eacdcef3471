//! Fire-and-forget publishing
//!
//! `Publisher` is what the relay's collaborators call when they have an event
//! to announce. Each publish spawns its own task owning a fresh
//! [`ReconnectingClient`] that connects, sends one envelope and closes. The
//! caller never waits on the network and never sees a failure; failures are
//! logged from inside the task.

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use url::Url;

use crate::broker::Topic;
use crate::client::backoff::BackoffPolicy;
use crate::client::reconnecting::ReconnectingClient;
use crate::transport::message::Envelope;
use crate::utils::{RelayError, Result};

#[derive(Debug, Clone)]
pub struct Publisher {
    base: Url,
    policy: BackoffPolicy,
    handle: Handle,
}

impl Publisher {
    /// Build a publisher spawning onto the current tokio runtime.
    pub fn new(base: &str, policy: BackoffPolicy) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| RelayError::NoRuntime)?;
        Self::with_handle(base, policy, handle)
    }

    /// Build a publisher spawning onto `handle`, for callers that are not
    /// themselves running inside the runtime.
    pub fn with_handle(base: &str, policy: BackoffPolicy, handle: Handle) -> Result<Self> {
        Ok(Self {
            base: Url::parse(base)?,
            policy,
            handle,
        })
    }

    /// The versioned endpoint for `topic`, e.g. `ws://host:8001/1.0/`,
    /// resolved relative to the base URL's path.
    pub fn endpoint(&self, topic: &Topic) -> Result<Url> {
        Ok(topic.endpoint(&self.base)?)
    }

    /// Publish `{event_type, payload}` to `topic` in the background.
    ///
    /// The returned handle may be dropped; the task runs to completion either way.
    pub fn publish(
        &self,
        topic: &str,
        event_type: impl Into<String>,
        payload: Value,
    ) -> JoinHandle<()> {
        let topic = Topic::from_path(topic);
        let envelope = Envelope::new(event_type, payload);
        let endpoint = self.endpoint(&topic);
        let policy = self.policy;

        self.handle.spawn(async move {
            let url = match endpoint {
                Ok(url) => url,
                Err(e) => {
                    error!(%topic, error = %e, "WebSocket publish failed");
                    return;
                }
            };

            let mut client = ReconnectingClient::new(url, policy);
            match client.publish_once(&envelope).await {
                Ok(()) => debug!(%topic, kind = envelope.event_type(), "Published event"),
                Err(e) => error!(
                    %topic,
                    kind = envelope.event_type(),
                    error = %e,
                    label = e.as_label(),
                    "WebSocket publish failed"
                ),
            }
        })
    }
}
