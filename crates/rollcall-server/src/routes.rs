//! Thin REST surface: resync snapshots and the enrollment commands.
//!
//! Every route takes `Authorization: Bearer <token>`. Business-rule
//! conflicts come back synchronously as `409` with a [`ConflictBody`].
//!
//! [`ConflictBody`]: rollcall_core::protocol::ConflictBody

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use rollcall_core::enrollment::{Decision, Enrollment, EnrollmentStatus, Role, StudentProfile};
use rollcall_core::errors::{AuthError, AuthorizationError};
use rollcall_core::ids::{ClassId, EnrollmentId};
use rollcall_core::traits::{Identity, Snapshot};

use crate::error::ApiError;
use crate::server::AppState;

/// Query for `GET /api/enrollments` and `GET /api/enrollments/status`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassQuery {
    /// One class.
    pub class_id: Option<ClassId>,
    /// Comma-separated classes, for a teacher resyncing several at once.
    pub class_ids: Option<String>,
}

impl ClassQuery {
    /// Every class named by `classId` and `classIds`, deduplicated. `None`
    /// when neither parameter is present; an empty `classIds=` is an
    /// explicit empty set.
    pub fn classes(&self) -> Option<Vec<ClassId>> {
        if self.class_id.is_none() && self.class_ids.is_none() {
            return None;
        }
        let mut classes: Vec<ClassId> = self.class_id.iter().cloned().collect();
        let listed = self
            .class_ids
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ClassId::from);
        for class in listed {
            if !classes.contains(&class) {
                classes.push(class);
            }
        }
        Some(classes)
    }
}

/// Body of `POST /api/enrollments`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    /// Class to join.
    pub class_id: ClassId,
    /// Display name shown to the teacher. Defaults to the user ID.
    #[serde(default)]
    pub name: Option<String>,
    /// Contact email.
    #[serde(default)]
    pub email: Option<String>,
}

/// Body of `POST /api/enrollments/{id}/decision`.
#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    /// `APPROVED` or `REJECTED`.
    pub decision: Decision,
}

/// Response of `GET /api/enrollments/status`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// The class asked about.
    pub class_id: ClassId,
    /// Latest status, or `null` if the student never requested.
    pub status: Option<EnrollmentStatus>,
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AuthError::InvalidToken("missing bearer token".into()))?;
    Ok(state.session.verifier.verify_token(token.trim()).await?)
}

fn require_role(identity: &Identity, required: Role) -> Result<(), ApiError> {
    if identity.role == required {
        Ok(())
    } else {
        Err(AuthorizationError::WrongRole {
            actual: identity.role,
            required,
        }
        .into())
    }
}

async fn require_owner(
    state: &AppState,
    identity: &Identity,
    class: &ClassId,
) -> Result<(), ApiError> {
    require_role(identity, Role::Teacher)?;
    if state.roster.is_owner(&identity.user_id, class).await {
        Ok(())
    } else {
        Err(AuthorizationError::NotClassOwner {
            user: identity.user_id.clone(),
            class: class.clone(),
        }
        .into())
    }
}

/// `GET /api/enrollments`: snapshot of the named classes for their owner,
/// own snapshot for students.
#[instrument(skip_all)]
pub async fn list_enrollments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ClassQuery>,
) -> Result<Json<Snapshot>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    let snapshot = match identity.role {
        Role::Teacher => {
            let classes = query.classes().ok_or_else(|| {
                ApiError::BadRequest("classId or classIds is required for teachers".into())
            })?;
            for class in &classes {
                require_owner(&state, &identity, class).await?;
            }
            state.store.snapshot_for_classes(&classes).await?
        }
        Role::Student => {
            let mut snapshot = state.store.snapshot_for_student(&identity.user_id).await?;
            if let Some(classes) = query.classes() {
                snapshot.enrollments.retain(|e| classes.contains(&e.class_id));
            }
            snapshot
        }
    };
    debug!(user_id = %identity.user_id, count = snapshot.enrollments.len(), "snapshot served");
    Ok(Json(snapshot))
}

/// `GET /api/enrollments/status?classId=`: the student's latest status.
#[instrument(skip_all)]
pub async fn enrollment_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ClassQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    require_role(&identity, Role::Student)?;
    let class_id = query
        .class_id
        .ok_or_else(|| ApiError::BadRequest("classId is required".into()))?;
    let status = state.store.get_status(&identity.user_id, &class_id).await?;
    Ok(Json(StatusResponse { class_id, status }))
}

/// `POST /api/enrollments`: a student asks to join a class.
#[instrument(skip_all)]
pub async fn request_enrollment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<Enrollment>), ApiError> {
    let identity = authenticate(&state, &headers).await?;
    require_role(&identity, Role::Student)?;

    let profile = StudentProfile {
        name: body.name.unwrap_or_else(|| identity.user_id.to_string()),
        email: body.email.unwrap_or_default(),
        student_id: identity.user_id,
    };
    let enrollment = state.store.create_enrollment(&profile, &body.class_id).await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

/// `POST /api/enrollments/{id}/decision`: an owner approves or rejects.
#[instrument(skip_all, fields(enrollment_id = %id))]
pub async fn decide_enrollment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<EnrollmentId>,
    Json(body): Json<DecisionRequest>,
) -> Result<Json<Enrollment>, ApiError> {
    let identity = authenticate(&state, &headers).await?;
    require_role(&identity, Role::Teacher)?;

    let current = state.store.get(&id).await?;
    require_owner(&state, &identity, &current.class_id).await?;

    let decided = state
        .store
        .decide_enrollment(&id, body.decision, &identity.user_id)
        .await?;
    Ok(Json(decided))
}
