//! Server error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use rollcall_core::errors::{AuthError, AuthorizationError, EnrollmentError};
use rollcall_core::protocol::ConflictBody;
use rollcall_store::StoreError;

/// Failures starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket bind or accept failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Token could not be signed.
    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    /// Backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error returned by the REST surface, rendered as JSON.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or bad bearer token.
    #[error(transparent)]
    Unauthenticated(#[from] AuthError),
    /// Authenticated, but not allowed.
    #[error(transparent)]
    Forbidden(#[from] AuthorizationError),
    /// Business-rule violation or missing record.
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    /// Request body or query is malformed.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Enrollment(e.into())
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, ConflictBody) {
        let body = |code: &str| ConflictBody {
            code: code.into(),
            message: self.to_string(),
            final_status: None,
        };
        match self {
            Self::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, body("UNAUTHENTICATED")),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, body("AUTHORIZATION")),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, body("BAD_REQUEST")),
            Self::Enrollment(e) => match e {
                EnrollmentError::AlreadyPending { .. } => {
                    (StatusCode::CONFLICT, body("ALREADY_PENDING"))
                }
                EnrollmentError::AlreadyEnrolled { .. } => {
                    (StatusCode::CONFLICT, body("ALREADY_ENROLLED"))
                }
                EnrollmentError::AlreadyDecided { final_status, .. } => (
                    StatusCode::CONFLICT,
                    ConflictBody {
                        final_status: Some(*final_status),
                        ..body("ALREADY_DECIDED")
                    },
                ),
                EnrollmentError::NotFound(_) => (StatusCode::NOT_FOUND, body("NOT_FOUND")),
                EnrollmentError::Storage(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, body("STORAGE"))
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(body)).into_response()
    }
}
