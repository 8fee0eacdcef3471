//! Envelope codec
//!
//! Every frame on the wire is a UTF-8 JSON object `{"type": ..., "data": ...}`.
//! The `type` string is kept verbatim so unknown kinds are relayed unchanged;
//! [`Envelope::kind`] maps it onto the closed [`EventKind`] set for dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::{RelayError, Result};

/// The `{type, data}` wire message unit. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from(self.event_type.as_str())
    }

    /// Serializes the envelope to its JSON wire form.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(RelayError::Encode)
    }
}

/// Event kinds the relay knows about, with a fallback for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A reader stored a record it had not seen before.
    NewArduinoData,
    /// A reader saw a record that was already stored.
    ExistingArduinoData,
    Unknown(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::NewArduinoData => "new_arduino_data",
            EventKind::ExistingArduinoData => "existing_arduino_data",
            EventKind::Unknown(other) => other,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Unknown(_))
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            "new_arduino_data" => EventKind::NewArduinoData,
            "existing_arduino_data" => EventKind::ExistingArduinoData,
            other => EventKind::Unknown(other.to_string()),
        }
    }
}

/// Encodes `{type, data}` to JSON text.
pub fn encode(event_type: &str, data: &Value) -> Result<String> {
    #[derive(Serialize)]
    struct Borrowed<'a> {
        #[serde(rename = "type")]
        event_type: &'a str,
        data: &'a Value,
    }

    serde_json::to_string(&Borrowed { event_type, data }).map_err(RelayError::Encode)
}

/// Parses JSON text into an [`Envelope`].
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    Ok(serde_json::from_slice(bytes)?)
}
