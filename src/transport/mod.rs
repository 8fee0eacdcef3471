//! The `transport` module is responsible for network communication with
//! clients over WebSockets.
//!
//! It defines the `{type, data}` envelope codec and implements the relay
//! server itself: accepting connections, scoping them to a topic, and
//! forwarding decoded envelopes to the broker's registry for fan-out.

pub mod message;
pub mod websocket;

pub use message::{Envelope, EventKind};
pub use websocket::{Closure, RelayServer, ServerState};

#[cfg(test)]
pub(crate) mod websocket_tests;
