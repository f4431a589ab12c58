//! Enrollment facts and the envelopes built from them.
//!
//! A fact is what the enrollment store reports after committing a mutation.
//! The broker wraps each fact in exactly one [`Envelope`], addressed to every
//! topic the fact touches.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enrollment::Enrollment;
use crate::ids::{ClassId, EventId};
use crate::topic::TopicKey;

/// Kind of enrollment lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A student requested to join a class.
    NewEnrollment,
    /// A pending enrollment was approved.
    EnrollmentAccepted,
    /// A pending enrollment was rejected.
    EnrollmentRejected,
}

impl EventType {
    /// Wire form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewEnrollment => "NEW_ENROLLMENT",
            Self::EnrollmentAccepted => "ENROLLMENT_ACCEPTED",
            Self::EnrollmentRejected => "ENROLLMENT_REJECTED",
        }
    }

    /// Whether this event carries a terminal decision.
    #[must_use]
    pub fn is_decision(self) -> bool {
        !matches!(self, Self::NewEnrollment)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW_ENROLLMENT" => Ok(Self::NewEnrollment),
            "ENROLLMENT_ACCEPTED" => Ok(Self::EnrollmentAccepted),
            "ENROLLMENT_REJECTED" => Ok(Self::EnrollmentRejected),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fact
// ─────────────────────────────────────────────────────────────────────────────

/// A committed enrollment mutation, as reported by the store's change feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentFact {
    /// Store-assigned, monotonically increasing change ID. Used for
    /// idempotent ingestion.
    pub change_id: i64,
    /// What happened.
    pub kind: EventType,
    /// Enrollment state right after the change.
    pub enrollment: Enrollment,
    /// Store clock at commit time.
    pub occurred_at: DateTime<Utc>,
}

impl EnrollmentFact {
    /// Topics this fact must be delivered to.
    ///
    /// New requests go to the class channel only. Decisions go to the class
    /// channel and to the requesting student.
    #[must_use]
    pub fn topics(&self) -> Vec<TopicKey> {
        let class = TopicKey::Class(self.enrollment.class_id.clone());
        if self.kind.is_decision() {
            vec![class, TopicKey::User(self.enrollment.student_id.clone())]
        } else {
            vec![class]
        }
    }

    /// Human-readable notification text.
    #[must_use]
    pub fn human_message(&self) -> String {
        let name = &self.enrollment.student_name;
        let class = &self.enrollment.class_id;
        match self.kind {
            EventType::NewEnrollment => format!("{name} requested to join class {class}"),
            EventType::EnrollmentAccepted => {
                format!("{name}'s request to join class {class} was accepted")
            }
            EventType::EnrollmentRejected => {
                format!("{name}'s request to join class {class} was rejected")
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// One addressed, typed, idempotency-tagged notification.
///
/// Serializes directly as the wire frame, with `type` as discriminator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Event kind; doubles as the frame `type`.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Unique per envelope; clients dedup on it.
    pub event_id: EventId,
    /// Class the enrollment belongs to.
    pub class_id: ClassId,
    /// Every topic this envelope was routed to.
    pub topics: Vec<TopicKey>,
    /// Enrollment snapshot right after the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrollment: Option<Enrollment>,
    /// Human-readable notification text.
    pub message: String,
    /// Server clock when the underlying change was committed.
    pub emitted_at: DateTime<Utc>,
}

impl Envelope {
    /// Wrap a fact in a fresh envelope.
    #[must_use]
    pub fn from_fact(fact: &EnrollmentFact) -> Self {
        Self {
            event_type: fact.kind,
            event_id: EventId::new(),
            class_id: fact.enrollment.class_id.clone(),
            topics: fact.topics(),
            enrollment: Some(fact.enrollment.clone()),
            message: fact.human_message(),
            emitted_at: fact.occurred_at,
        }
    }

    /// Whether the envelope was routed to `topic`.
    #[must_use]
    pub fn is_addressed_to(&self, topic: &TopicKey) -> bool {
        self.topics.contains(topic)
    }
}
