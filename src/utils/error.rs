//! The `error` module defines the error types used within `pathcast`.
//!
//! Every per-connection failure is expressed as a [`RelayError`] so the server
//! and the client can contain it to the connection it happened on. Reaching the
//! retry ceiling is not an error to unwind on; it is reported as a [`GivenUp`]
//! value and only converted into [`RelayError::GivenUp`] when a caller wants `?`.

use thiserror::Error;

/// Errors produced by the relay, its connections and the reconnecting client.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RelayError {
    /// An inbound frame was not a valid envelope. The connection stays open.
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),

    /// An envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    /// The peer or the network closed the connection.
    #[error("connection closed with code {code}: {reason}")]
    ConnectionClosed { code: u16, reason: String },

    /// A write to one recipient failed.
    #[error("send to {connection} failed: {source}")]
    Send {
        connection: String,
        #[source]
        source: tungstenite::Error,
    },

    /// The client could not establish a connection.
    #[error("connect to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    /// An operation needed an established connection and there was none.
    #[error("no connection established")]
    NotConnected,

    /// The client exhausted its retry ceiling.
    #[error("gave up after {attempts} reconnection attempts")]
    GivenUp { attempts: u32 },

    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A background publish was requested outside of a tokio runtime.
    #[error("no tokio runtime available to spawn the publish task")]
    NoRuntime,
}

impl RelayError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RelayError::Decode(_) => "decode_error",
            RelayError::Encode(_) => "encode_error",
            RelayError::ConnectionClosed { .. } => "connection_closed",
            RelayError::Send { .. } => "send_error",
            RelayError::Connect { .. } => "connect_error",
            RelayError::NotConnected => "not_connected",
            RelayError::GivenUp { .. } => "given_up",
            RelayError::Url(_) => "invalid_url",
            RelayError::Io(_) => "io_error",
            RelayError::NoRuntime => "no_runtime",
        }
    }
}

/// Terminal outcome of the reconnection routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GivenUp {
    /// Value of the attempt counter when the ceiling was exceeded.
    pub attempts: u32,
}

impl From<GivenUp> for RelayError {
    fn from(given_up: GivenUp) -> Self {
        RelayError::GivenUp {
            attempts: given_up.attempts,
        }
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
