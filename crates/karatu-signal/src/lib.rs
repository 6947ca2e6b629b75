//! Karatu call-signaling relay.
//!
//! Library surface for the relay server: the HTTP/WebSocket API layer and
//! the in-memory signaling core. The binary in `main.rs` adds CLI, config,
//! and logging on top.

pub mod api;
pub mod relay;
