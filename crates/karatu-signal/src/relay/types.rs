//! Wire types for the signaling protocol.
//!
//! Every frame is a single JSON object tagged with a `type` field. The
//! variants are closed: a frame whose tag or required fields do not match
//! is rejected at the boundary instead of being forwarded. Offer/answer/ICE
//! bodies stay opaque — only the `sessionId` used for routing is typed, the
//! rest of the object is captured verbatim and relayed unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Server-assigned identifier for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A call invitation record, forwarded verbatim to the callee's channel.
///
/// `tutor_id`/`student_id`/`session_id` are required for routing and for the
/// callee to build a rejoin-and-answer UI; anything else the caller attaches
/// (display name, topic, avatar, ...) rides along in `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInvite {
    pub tutor_id: String,
    pub student_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tutor_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An opaque signaling body (offer, answer, or ICE candidate).
///
/// The relay reads `session_id` to pick the room and nothing else; the
/// remainder belongs to the WebRTC negotiation layer on the clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalBody {
    pub session_id: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Frames accepted from clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join the per-user channel used for out-of-band call invitations.
    RegisterIdentity { user_id: String },
    /// Ring the callee: forwarded to the student's user channel.
    InitiateCall(CallInvite),
    /// Callee declined: forwarded to the tutor's user channel.
    DeclineCall {
        session_id: String,
        student_id: String,
        tutor_id: String,
    },
    /// Either side hung up: forwarded to both participants' channels.
    EndCall {
        session_id: String,
        student_id: String,
        tutor_id: String,
    },
    /// Enter the room for one tutoring session.
    JoinRoom { session_id: String },
    Offer(SignalBody),
    Answer(SignalBody),
    IceCandidate(SignalBody),
}

/// Frames emitted by the relay.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Handshake acknowledgement carrying the connection's assigned id.
    Connected { peer_id: ConnectionId },
    IncomingCall(CallInvite),
    CallDeclined {
        session_id: String,
        student_id: String,
        tutor_id: String,
    },
    CallEnded { session_id: String },
    /// A new connection entered a room this connection is in.
    PeerJoined { peer_id: ConnectionId },
    /// Reply to a join: the members that were already present.
    CurrentMembers { members: Vec<ConnectionId> },
    Offer(SignalBody),
    Answer(SignalBody),
    IceCandidate(SignalBody),
    /// A room member's connection went away.
    PeerLeft { peer_id: ConnectionId },
}
