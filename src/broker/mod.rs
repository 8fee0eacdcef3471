//! The `broker` module holds the relay's shared state: topics, the
//! connections joined to them, and the registry that fans envelopes out.

pub mod connection;
pub mod registry;
pub mod topic;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use registry::Registry;
pub use topic::Topic;
