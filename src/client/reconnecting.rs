//! Reconnecting client
//!
//! `ReconnectingClient` talks to one topic endpoint of the relay. It can
//! publish envelopes, listen for the envelopes other connections publish, and
//! recover from disconnection on its own:
//!
//! ```text
//! Connected -> Disconnected -> Backoff -> Connecting -> Connected
//!                                 ^            |
//!                                 +------------+   (connect failed)
//! Backoff --(attempts > max_retries)--> GivenUp
//! ```
//!
//! The only suspension points are network I/O and the backoff sleep. Dropping
//! the future returned by [`ReconnectingClient::listen`] or
//! [`ReconnectingClient::reconnect`] cancels the routine at whichever of those
//! it is parked on.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use tungstenite::Utf8Bytes;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use crate::client::backoff::BackoffPolicy;
use crate::transport::message::{Envelope, decode};
use crate::transport::websocket::Closure;
use crate::utils::{GivenUp, RelayError, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStage {
    Disconnected,
    Connected,
    Backoff,
    Connecting,
    GivenUp,
}

pub struct ReconnectingClient {
    url: Url,
    stream: Option<WsStream>,
    policy: BackoffPolicy,
    attempts: u32,
    stage: ClientStage,
}

impl ReconnectingClient {
    pub fn new(url: Url, policy: BackoffPolicy) -> Self {
        Self {
            url,
            stream: None,
            policy,
            attempts: 0,
            stage: ClientStage::Disconnected,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn stage(&self) -> ClientStage {
        self.stage
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Establish the connection. A failure is returned, not retried; retries
    /// are driven by [`ReconnectingClient::reconnect`].
    pub async fn connect(&mut self) -> Result<()> {
        match connect_async(self.url.as_str()).await {
            Ok((stream, _response)) => {
                info!(url = %self.url, "Connected to WebSocket relay");
                self.stream = Some(stream);
                self.attempts = 0;
                self.stage = ClientStage::Connected;
                Ok(())
            }
            Err(source) => {
                warn!(url = %self.url, error = %source, "Connection failed");
                self.stream = None;
                self.stage = ClientStage::Disconnected;
                Err(RelayError::Connect {
                    url: self.url.to_string(),
                    source,
                })
            }
        }
    }

    /// Write one envelope. Requires an established connection.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(RelayError::NotConnected)?;
        let text = envelope.encode()?;

        if let Err(source) = stream.send(WsMessage::text(text)).await {
            self.stream = None;
            self.stage = ClientStage::Disconnected;
            return Err(RelayError::Send {
                connection: self.url.to_string(),
                source,
            });
        }

        debug!(url = %self.url, kind = envelope.event_type(), "Sent envelope");
        Ok(())
    }

    /// Close the connection gracefully if one is open. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        self.stage = ClientStage::Disconnected;

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static("client closing"),
        };
        match stream.close(Some(frame)).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                debug!(url = %self.url, "Connection closed");
                Ok(())
            }
            Err(source) => Err(RelayError::Send {
                connection: self.url.to_string(),
                source,
            }),
        }
    }

    /// Hand every inbound envelope to `handler` until the connection drops,
    /// then reconnect and keep listening. Returns only once the retry ceiling
    /// has been exceeded.
    pub async fn listen<F>(&mut self, mut handler: F) -> GivenUp
    where
        F: FnMut(Envelope),
    {
        loop {
            if let Some(stream) = self.stream.as_mut() {
                let closure = receive_until_closed(stream, &mut handler).await;
                match closure.to_error() {
                    None => info!(url = %self.url, "Connection closed normally"),
                    Some(e) => warn!(
                        url = %self.url,
                        error = %e,
                        label = e.as_label(),
                        "Disconnected from relay"
                    ),
                }
                self.stream = None;
                self.stage = ClientStage::Disconnected;
            }

            if let Err(given_up) = self.reconnect().await {
                return given_up;
            }
        }
    }

    /// Drive the backoff state machine until a connection is established or
    /// the retry ceiling is exceeded.
    pub async fn reconnect(&mut self) -> std::result::Result<(), GivenUp> {
        loop {
            self.attempts += 1;
            if self.policy.exhausted(self.attempts) {
                self.stage = ClientStage::GivenUp;
                error!(
                    url = %self.url,
                    attempts = self.attempts,
                    "Maximum reconnection attempts reached, giving up"
                );
                return Err(GivenUp {
                    attempts: self.attempts,
                });
            }

            self.stage = ClientStage::Backoff;
            let computed = self.policy.base_delay(self.attempts);
            let delay = self.policy.delay(self.attempts);
            info!(
                attempt = self.attempts,
                computed_ms = computed.as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );
            tokio::time::sleep(delay).await;

            self.stage = ClientStage::Connecting;
            if self.connect().await.is_ok() {
                return Ok(());
            }
        }
    }

    /// Connect, send `envelope`, and close, always closing even when the send
    /// fails.
    pub async fn publish_once(&mut self, envelope: &Envelope) -> Result<()> {
        self.connect().await?;
        let sent = self.send(envelope).await;
        let closed = self.close().await;
        sent.and(closed)
    }

    /// Connect (recovering through backoff if the first attempt fails), send
    /// `envelope`, then listen with `handler`.
    pub async fn run_and_listen<F>(&mut self, envelope: &Envelope, handler: F) -> Result<()>
    where
        F: FnMut(Envelope),
    {
        if self.connect().await.is_err() {
            self.reconnect().await?;
        }
        self.send(envelope).await?;
        Err(self.listen(handler).await.into())
    }
}

async fn receive_until_closed<F>(stream: &mut WsStream, handler: &mut F) -> Closure
where
    F: FnMut(Envelope),
{
    loop {
        let decoded = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => decode(text.as_bytes()),
            Some(Ok(WsMessage::Binary(bytes))) => decode(&bytes),
            Some(Ok(WsMessage::Close(frame))) => {
                // write the queued close reply before the stream is dropped
                if let Err(e) = stream.flush().await {
                    debug!(error = %e, "close reply not delivered");
                }
                return Closure::from_frame(frame.as_ref());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Closure::from_error(&e),
            None => return Closure::Abnormal,
        };

        match decoded {
            Ok(envelope) => handler(envelope),
            Err(e) => warn!(error = %e, "Ignoring malformed inbound frame"),
        }
    }
}
