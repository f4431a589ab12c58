//! Error taxonomy for the notification pipeline.
//!
//! - [`AuthError`]: bad or expired credentials. The connection is refused
//!   and the client does not retry automatically.
//! - [`AuthorizationError`]: a subscribe the session may not make. The frame
//!   is rejected, the connection stays open.
//! - [`EnrollmentError`]: business-rule violations returned synchronously to
//!   whoever called `request_enrollment` / `decide`.
//! - [`TransportError`]: network failure. Triggers reconnect backoff.
//! - [`StaleEventError`]: an envelope older than the last snapshot. Dropped
//!   by the reconciler and logged, never surfaced.
//!
//! [`CoreError`] unifies them for callers that do not care which domain
//! failed.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::enrollment::{EnrollmentStatus, Role};
use crate::ids::{ClassId, EnrollmentId, EventId, UserId};
use crate::topic::TopicKey;

/// Credential verification failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Token is malformed or its signature does not verify.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Token is past its expiry.
    #[error("token expired")]
    Expired,
    /// The identity claimed in the AUTH frame differs from the token's.
    #[error("claimed identity {claimed_user}/{claimed_role} does not match token")]
    IdentityMismatch {
        /// User ID from the AUTH frame.
        claimed_user: UserId,
        /// Role from the AUTH frame.
        claimed_role: Role,
    },
    /// No AUTH frame arrived in time.
    #[error("authentication timed out")]
    Timeout,
    /// Server refused the handshake with this reason.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// A request for data the identity may not see.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    /// Only the class owner may follow `class:{id}`.
    #[error("{user} does not own class {class}")]
    NotClassOwner {
        /// Requesting user.
        user: UserId,
        /// Target class.
        class: ClassId,
    },
    /// `user:{id}` is readable by that user only.
    #[error("{user} may not subscribe to {topic}")]
    ForeignUserTopic {
        /// Requesting user.
        user: UserId,
        /// Target topic.
        topic: TopicKey,
    },
    /// The action requires a different role.
    #[error("role {actual} may not perform this action (requires {required})")]
    WrongRole {
        /// Role held.
        actual: Role,
        /// Role needed.
        required: Role,
    },
}

/// Enrollment business-rule violations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EnrollmentError {
    /// A pending request already exists for this (student, class).
    #[error("enrollment {existing} is already pending")]
    AlreadyPending {
        /// The existing pending enrollment.
        existing: EnrollmentId,
    },
    /// The student is already approved for this class.
    #[error("student is already enrolled ({existing})")]
    AlreadyEnrolled {
        /// The approved enrollment.
        existing: EnrollmentId,
    },
    /// Another caller decided this enrollment first.
    #[error("enrollment {enrollment_id} was already decided: {final_status}")]
    AlreadyDecided {
        /// The contested enrollment.
        enrollment_id: EnrollmentId,
        /// The status the winner committed.
        final_status: EnrollmentStatus,
    },
    /// No enrollment with this ID.
    #[error("enrollment not found: {0}")]
    NotFound(EnrollmentId),
    /// The backing store failed.
    #[error("enrollment store failure: {0}")]
    Storage(String),
}

/// Network-level failure between client and server.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// An envelope that predates the current snapshot baseline.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("event {event_id} emitted at {emitted_at} predates snapshot at {last_synced_at}")]
pub struct StaleEventError {
    /// The dropped envelope.
    pub event_id: EventId,
    /// When it was emitted.
    pub emitted_at: DateTime<Utc>,
    /// The snapshot baseline it lost to.
    pub last_synced_at: DateTime<Utc>,
}

/// Any pipeline error.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Authentication failure.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Authorization failure.
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    /// Enrollment rule violation.
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    /// Network failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Stale event.
    #[error(transparent)]
    Stale(#[from] StaleEventError),
}

impl CoreError {
    /// Whether a reconnect loop should keep trying after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
