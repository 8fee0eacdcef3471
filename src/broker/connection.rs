//! Connection representation
//!
//! A `Connection` is the write half of one accepted WebSocket, scoped to the
//! topic it joined. The read half stays with the task running its receive
//! loop; the registry only ever writes through [`Connection::send`] and
//! [`Connection::close`].
//!
//! Writes are serialized by a per-connection async lock, so concurrent
//! broadcasts never interleave frames on the same socket.

use std::fmt;
use std::pin::Pin;

use futures_util::{Sink, SinkExt};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tungstenite::Utf8Bytes;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::CloseFrame;
use tungstenite::protocol::frame::coding::CloseCode;
use uuid::Uuid;

use crate::broker::topic::Topic;
use crate::utils::{RelayError, Result};

pub type ConnectionId = String;

/// Boxed write half of a WebSocket.
pub type WsSink = Pin<Box<dyn Sink<WsMessage, Error = tungstenite::Error> + Send>>;

/// Per-connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Reading,
    ClosingNormal,
    ClosingAbnormal,
    ClosingError,
    Closed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Reading)
    }

    fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (Open, Reading) => true,
            (Open | Reading, ClosingNormal | ClosingAbnormal | ClosingError) => true,
            (_, Closed) => true,
            _ => false,
        }
    }
}

pub struct Connection {
    pub id: ConnectionId,
    pub topic: Topic,
    writer: AsyncMutex<WsSink>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Create a connection on `topic` writing through `sink`. The `id` is a
    /// UUID used to identify the connection in the registry and in logs.
    pub fn new<S>(topic: Topic, sink: S) -> Self
    where
        S: Sink<WsMessage, Error = tungstenite::Error> + Send + 'static,
    {
        Self {
            id: format!("conn-{}", Uuid::new_v4()),
            topic,
            writer: AsyncMutex::new(Box::pin(sink)),
            state: Mutex::new(ConnectionState::Open),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Move to `next` if the state machine allows it. Returns whether it moved.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if state.can_advance_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Write one frame. Fails without touching the socket once the connection
    /// is closing; a failed write moves it to `ClosingError`.
    pub async fn send(&self, msg: WsMessage) -> Result<()> {
        if !self.is_open() {
            return Err(self.send_error(tungstenite::Error::AlreadyClosed));
        }

        let mut writer = self.writer.lock().await;
        match writer.send(msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.advance(ConnectionState::ClosingError);
                Err(self.send_error(e))
            }
        }
    }

    /// Start a graceful close with `code`. Idempotent: only the first call
    /// writes a close frame.
    pub async fn close(&self, code: CloseCode, reason: &'static str) -> Result<()> {
        let next = if code == CloseCode::Normal {
            ConnectionState::ClosingNormal
        } else {
            ConnectionState::ClosingError
        };
        if !self.advance(next) {
            return Ok(());
        }

        let frame = CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        };
        let mut writer = self.writer.lock().await;
        let result = match writer.send(WsMessage::Close(Some(frame))).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(self.send_error(e)),
        };
        drop(writer);

        self.advance(ConnectionState::Closed);
        result
    }

    /// Write out frames the protocol layer queued on its own, such as the
    /// reply to a close frame the peer sent. Works in any state.
    pub async fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.flush().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(self.send_error(e)),
        }
    }

    /// Mark the connection closed without a handshake.
    pub fn force_close(&self) {
        self.advance(ConnectionState::Closed);
    }

    fn send_error(&self, source: tungstenite::Error) -> RelayError {
        RelayError::Send {
            connection: self.id.clone(),
            source,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}
