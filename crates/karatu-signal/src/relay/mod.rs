//! Call-signaling relay core.
//!
//! Groups transient WebSocket connections into session rooms (one per
//! tutoring session) and per-user channels (one per account), and forwards
//! opaque offer/answer/ICE payloads between room members without inspecting
//! them. Call invitations travel out-of-band over the user channels.
//!
//! All state is ephemeral and process-local. A reconnecting client must
//! re-issue `register-identity` and `join-room`; the relay keeps no session
//! affinity across a dropped transport.

mod handler;
mod registry;
mod types;

pub use handler::ws_handler;
pub use registry::RelayRegistry;
pub use types::{CallInvite, ClientMessage, ConnectionId, ServerMessage, SignalBody};
