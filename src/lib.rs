//! # pathcast
//!
//! `pathcast` is a path-scoped broadcast relay over WebSockets. Every
//! connection joins the topic named by its request path (for example `/1.0/`),
//! and every `{type, data}` envelope a connection sends is fanned out to the
//! other connections on the same topic.
//!
//! ## Core Modules
//!
//! - `broker`: topics, connections, and the registry that owns them and fans envelopes out.
//! - `transport`: the envelope codec and the WebSocket relay server.
//! - `client`: a self-healing client with exponential backoff, and the fire-and-forget `Publisher`.
//! - `config`: loading and merging server/client configuration.
//! - `utils`: error types, logging setup and shutdown signals.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;
