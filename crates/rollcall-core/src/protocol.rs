//! WebSocket wire frames.
//!
//! Every frame is a JSON text message with a `type` discriminator and
//! camelCase fields. Enrollment envelopes share the server frame space with
//! control frames; see [`ServerFrame`].

use serde::{Deserialize, Serialize};

use crate::enrollment::{EnrollmentStatus, Role};
use crate::envelope::Envelope;
use crate::ids::{EventId, UserId};
use crate::topic::TopicKey;

// ─────────────────────────────────────────────────────────────────────────────
// Client → Server
// ─────────────────────────────────────────────────────────────────────────────

/// Frames sent by a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientFrame {
    /// Must be the first frame on a connection.
    Auth {
        /// Claimed user.
        user_id: UserId,
        /// Claimed role.
        role: Role,
        /// Short-lived token from the auth service.
        token: String,
    },
    /// Add a topic to this session.
    Subscribe {
        /// Topic key, e.g. `class:C`.
        topic: String,
    },
    /// Remove a topic from this session.
    Unsubscribe {
        /// Topic key.
        topic: String,
    },
    /// Liveness ping.
    Heartbeat,
    /// Ask for buffered envelopes newer than `last_event_id`.
    Replay {
        /// Last envelope the client applied.
        last_event_id: EventId,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → Client
// ─────────────────────────────────────────────────────────────────────────────

/// Machine-readable error codes carried by [`ControlFrame::Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Subscribe to a topic the session may not read.
    Authorization,
    /// Frame could not be parsed or is not valid in this state.
    InvalidFrame,
    /// Topic string is malformed.
    InvalidTopic,
    /// Non-AUTH frame before authentication.
    NotAuthenticated,
}

/// Server control frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ControlFrame {
    /// Authentication succeeded.
    AuthOk {
        /// Server-side session ID, for diagnostics.
        #[serde(default)]
        session_id: String,
    },
    /// Authentication failed. The connection is closed afterwards.
    AuthRejected {
        /// Why.
        reason: String,
    },
    /// Reply to a heartbeat.
    HeartbeatAck,
    /// Subscription accepted (or already held).
    Subscribed {
        /// Topic key.
        topic: TopicKey,
    },
    /// Subscription removed.
    Unsubscribed {
        /// Topic key.
        topic: TopicKey,
    },
    /// A frame was rejected. The connection stays open.
    Error {
        /// Error class.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
        /// Topic involved, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
    },
    /// Replay finished; `replayed` envelopes were sent before this frame.
    ReplayComplete {
        /// Number of replayed envelopes.
        replayed: usize,
    },
    /// The replay window no longer covers the requested event. Resync.
    ReplayUnavailable,
}

/// Any frame sent by the server.
///
/// Control frames are tried first; anything whose `type` names an
/// enrollment event decodes as an [`Envelope`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Protocol control.
    Control(ControlFrame),
    /// Enrollment notification.
    Envelope(Envelope),
}

impl From<ControlFrame> for ServerFrame {
    fn from(frame: ControlFrame) -> Self {
        Self::Control(frame)
    }
}

impl From<Envelope> for ServerFrame {
    fn from(envelope: Envelope) -> Self {
        Self::Envelope(envelope)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// REST bodies
// ─────────────────────────────────────────────────────────────────────────────

/// Error body returned by the REST surface on business-rule conflicts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictBody {
    /// `ALREADY_PENDING`, `ALREADY_ENROLLED`, `ALREADY_DECIDED`, …
    pub code: String,
    /// Human-readable detail.
    pub message: String,
    /// Status that actually won, for `ALREADY_DECIDED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_status: Option<EnrollmentStatus>,
}
