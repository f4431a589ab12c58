//! Enrollment record and its lifecycle vocabulary.
//!
//! An [`Enrollment`] moves `PENDING → APPROVED | REJECTED`. Both decided
//! states are terminal: once an enrollment leaves `PENDING` it never changes
//! again. A rejected student may request again, which creates a brand new
//! enrollment with a fresh ID.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClassId, EnrollmentId, UserId};

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of an enrollment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    /// Requested by the student, awaiting a teacher decision.
    Pending,
    /// Accepted by a class owner. Terminal.
    Approved,
    /// Declined by a class owner. Terminal.
    Rejected,
}

impl EnrollmentStatus {
    /// Wire and storage form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }

    /// Whether no further transition is permitted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(format!("unknown enrollment status: {other}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decision
// ─────────────────────────────────────────────────────────────────────────────

/// A teacher's verdict on a pending enrollment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Accept the student into the class.
    Approved,
    /// Decline the request.
    Rejected,
}

impl Decision {
    /// The terminal status this decision produces.
    #[must_use]
    pub fn target_status(self) -> EnrollmentStatus {
        match self {
            Self::Approved => EnrollmentStatus::Approved,
            Self::Rejected => EnrollmentStatus::Rejected,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target_status().as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Role
// ─────────────────────────────────────────────────────────────────────────────

/// Role of an authenticated identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Requests enrollments and receives decisions on `user:{id}`.
    Student,
    /// Owns classes, decides enrollments, listens on `class:{id}`.
    Teacher,
}

impl Role {
    /// Wire form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Self::Student),
            "teacher" => Ok(Self::Teacher),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Enrollment
// ─────────────────────────────────────────────────────────────────────────────

/// One student's request to join one class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    /// Unique enrollment ID.
    pub enrollment_id: EnrollmentId,
    /// Class the student asked to join.
    pub class_id: ClassId,
    /// Requesting student.
    pub student_id: UserId,
    /// Student display name, used for notification text.
    pub student_name: String,
    /// Student contact email.
    pub student_email: String,
    /// Current lifecycle status.
    pub status: EnrollmentStatus,
    /// When the request was made.
    pub requested_at: DateTime<Utc>,
    /// When the decision was committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    /// Teacher who made the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<UserId>,
}

impl Enrollment {
    /// Whether the enrollment has left `PENDING`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Student details attached to a new enrollment request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProfile {
    /// Student user ID.
    pub student_id: UserId,
    /// Display name.
    pub name: String,
    /// Contact email.
    pub email: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Enrollment {
        Enrollment {
            enrollment_id: EnrollmentId::from("e-1"),
            class_id: ClassId::from("c-1"),
            student_id: UserId::from("s-1"),
            student_name: "Ada".into(),
            student_email: "ada@example.com".into(),
            status: EnrollmentStatus::Pending,
            requested_at: DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            decided_at: None,
            decided_by: None,
        }
    }

    #[test]
    fn status_terminality() {
        assert!(!EnrollmentStatus::Pending.is_terminal());
        assert!(EnrollmentStatus::Approved.is_terminal());
        assert!(EnrollmentStatus::Rejected.is_terminal());
    }

    #[test]
    fn status_parse_display_agree() {
        for s in [
            EnrollmentStatus::Pending,
            EnrollmentStatus::Approved,
            EnrollmentStatus::Rejected,
        ] {
            assert_eq!(s.to_string().parse::<EnrollmentStatus>().unwrap(), s);
        }
        assert!("pending".parse::<EnrollmentStatus>().is_err());
    }

    #[test]
    fn decision_maps_to_terminal_status() {
        assert_eq!(Decision::Approved.target_status(), EnrollmentStatus::Approved);
        assert_eq!(Decision::Rejected.target_status(), EnrollmentStatus::Rejected);
        assert!(Decision::Rejected.target_status().is_terminal());
    }

    #[test]
    fn role_wire_form() {
        assert_eq!(serde_json::to_string(&Role::Teacher).unwrap(), "\"teacher\"");
        assert_eq!("student".parse::<Role>().unwrap(), Role::Student);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn enrollment_serializes_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["enrollmentId"], "e-1");
        assert_eq!(json["studentName"], "Ada");
        assert_eq!(json["status"], "PENDING");
        assert!(json.get("decidedAt").is_none());
    }

    #[test]
    fn enrollment_terminal_fields_roundtrip() {
        let mut e = sample();
        e.status = EnrollmentStatus::Approved;
        e.decided_by = Some(UserId::from("t-1"));
        e.decided_at = Some(e.requested_at);
        let back: Enrollment = serde_json::from_value(serde_json::to_value(&e).unwrap()).unwrap();
        assert_eq!(back, e);
        assert!(back.is_terminal());
    }
}
