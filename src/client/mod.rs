//! The `client` module is the outbound side of the relay.
//!
//! It provides the `ReconnectingClient`, which publishes to and listens on a
//! topic endpoint and recovers from disconnection with exponential backoff,
//! and the `Publisher`, the fire-and-forget entry point collaborators use.

pub mod backoff;
pub mod publish;
pub mod reconnecting;

pub use backoff::BackoffPolicy;
pub use publish::Publisher;
pub use reconnecting::{ClientStage, ReconnectingClient};
