//! Collaborator interfaces the pipeline consumes.
//!
//! The server depends only on these traits; `rollcall-store` and the
//! server's JWT authority provide the stock implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enrollment::{Decision, Enrollment, EnrollmentStatus, Role, StudentProfile};
use crate::errors::{AuthError, EnrollmentError};
use crate::ids::{ClassId, EnrollmentId, UserId};

/// A verified identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Authenticated user.
    pub user_id: UserId,
    /// Their role.
    pub role: Role,
}

/// Turns a bearer token into an identity.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `token` and return the identity it was issued to.
    async fn verify_token(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Answers class ownership questions.
#[async_trait]
pub trait ClassRoster: Send + Sync {
    /// Whether `teacher` owns `class`.
    async fn is_owner(&self, teacher: &UserId, class: &ClassId) -> bool;
}

/// Authoritative enrollment records.
///
/// Implementations must make [`decide`](Self::decide) a compare-and-swap on
/// `PENDING`: exactly one of any number of concurrent calls succeeds.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Create a pending enrollment.
    async fn create_enrollment(
        &self,
        student: &StudentProfile,
        class: &ClassId,
    ) -> Result<Enrollment, EnrollmentError>;

    /// Commit a terminal decision.
    async fn decide_enrollment(
        &self,
        id: &EnrollmentId,
        decision: Decision,
        decided_by: &UserId,
    ) -> Result<Enrollment, EnrollmentError>;

    /// Look up one enrollment.
    async fn get(&self, id: &EnrollmentId) -> Result<Enrollment, EnrollmentError>;

    /// Pending requests for a class.
    async fn list_pending(&self, class: &ClassId) -> Result<Vec<Enrollment>, EnrollmentError>;

    /// Latest status of a student in a class, if they ever requested.
    async fn get_status(
        &self,
        student: &UserId,
        class: &ClassId,
    ) -> Result<Option<EnrollmentStatus>, EnrollmentError>;

    /// Every enrollment of the given classes in one read, with the server
    /// clock at read time.
    async fn snapshot_for_classes(&self, classes: &[ClassId]) -> Result<Snapshot, EnrollmentError>;

    /// Every enrollment of a student, with the server clock at read time.
    async fn snapshot_for_student(&self, student: &UserId) -> Result<Snapshot, EnrollmentError>;
}

/// A consistent read of enrollments plus the instant it reflects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// The enrollments.
    pub enrollments: Vec<Enrollment>,
    /// Server clock when the read was taken.
    pub as_of: DateTime<Utc>,
}
