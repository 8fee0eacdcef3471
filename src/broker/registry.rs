//! Connection registry
//!
//! The registry owns the mapping from topic to the live connections on it and
//! is the only state shared between connection tasks. It is created once per
//! server and handed to every component that needs it.
//!
//! Concurrency notes:
//! - The map sits behind one synchronous lock that is never held across an
//!   `.await`. `broadcast` and `close_all` take a snapshot under the lock and
//!   release it before writing to any socket.
//! - A topic entry whose set becomes empty is removed immediately.
//! - Recipients whose write fails during fan-out are removed via `leave`
//!   after the fan-out completes; the failure is logged, never returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::broker::connection::{Connection, ConnectionId};
use crate::broker::topic::Topic;
use crate::transport::message::Envelope;

type Members = HashMap<ConnectionId, Arc<Connection>>;

#[derive(Debug, Default)]
pub struct Registry {
    topics: Mutex<HashMap<Topic, Members>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to its topic's set, creating the set if absent.
    /// Joining twice is a no-op.
    pub fn join(&self, connection: Arc<Connection>) {
        let mut topics = self.topics.lock();
        let members = topics.entry(connection.topic.clone()).or_default();
        if members.contains_key(&connection.id) {
            return;
        }
        debug!(
            connection = %connection.id,
            topic = %connection.topic,
            "joined topic"
        );
        members.insert(connection.id.clone(), connection);
    }

    /// Remove a connection from `topic`, dropping the topic entry once it is
    /// empty. Returns whether the connection was a member.
    pub fn leave(&self, topic: &Topic, id: &ConnectionId) -> bool {
        let mut topics = self.topics.lock();
        let Some(members) = topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(id).is_some();
        if members.is_empty() {
            topics.remove(topic);
        }
        if removed {
            debug!(connection = %id, %topic, "left topic");
        }
        removed
    }

    /// Deliver `envelope` to every connection on `topic`.
    ///
    /// Returns how many connections delivery was attempted to.
    pub async fn broadcast(&self, topic: &Topic, envelope: &Envelope) -> usize {
        self.broadcast_except(topic, envelope, None).await
    }

    /// Like [`Registry::broadcast`], skipping `exclude` if it is a member.
    pub async fn broadcast_except(
        &self,
        topic: &Topic,
        envelope: &Envelope,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let recipients: Vec<Arc<Connection>> = {
            let topics = self.topics.lock();
            match topics.get(topic) {
                Some(members) => members
                    .values()
                    .filter(|c| Some(&c.id) != exclude)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };

        if recipients.is_empty() {
            debug!(%topic, "no recipients for broadcast");
            return 0;
        }

        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(%topic, error = %e, "dropping broadcast");
                return 0;
            }
        };
        let ws_msg = WsMessage::text(text);

        let sends = recipients.iter().map(|connection| {
            let ws_msg = ws_msg.clone();
            async move { connection.send(ws_msg).await }
        });
        let results = join_all(sends).await;

        for (connection, result) in recipients.iter().zip(results) {
            if let Err(e) = result {
                warn!(connection = %connection.id, %topic, error = %e, "delivery failed");
                self.leave(topic, &connection.id);
            }
        }

        recipients.len()
    }

    /// Close every connection with the normal-closure code, concurrently,
    /// giving each at most `grace` to finish. Connections that do not close in
    /// time are dropped. The registry is empty afterwards.
    pub async fn close_all(&self, grace: Duration) {
        let connections: Vec<Arc<Connection>> = {
            let topics = self.topics.lock();
            topics
                .values()
                .flat_map(|members| members.values().cloned())
                .collect()
        };

        info!(count = connections.len(), "closing all connections");

        let closes = connections.iter().map(|connection| async move {
            match tokio::time::timeout(grace, connection.close(CloseCode::Normal, "server shutdown"))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(connection = %connection.id, error = %e, "close failed");
                }
                Err(_) => {
                    warn!(connection = %connection.id, ?grace, "close timed out, dropping");
                }
            }
            connection.force_close();
        });
        join_all(closes).await;

        self.topics.lock().clear();
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.lock().get(topic).map_or(0, |members| members.len())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.topics.lock().values().map(|members| members.len()).sum()
    }

    pub fn contains(&self, topic: &Topic, id: &ConnectionId) -> bool {
        self.topics
            .lock()
            .get(topic)
            .is_some_and(|members| members.contains_key(id))
    }

    pub fn is_empty(&self) -> bool {
        self.topics.lock().is_empty()
    }
}
