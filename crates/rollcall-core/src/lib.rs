//! # rollcall-core
//!
//! Shared vocabulary for the enrollment notification pipeline:
//!
//! - **Branded IDs**: `EnrollmentId`, `UserId`, `ClassId`, `SessionId`, `EventId`
//! - **Enrollment**: the record, its status machine vocabulary, roles
//! - **Topics**: `class:{id}` / `user:{id}` routing keys
//! - **Envelopes**: store facts and the notifications built from them
//! - **Protocol**: WebSocket frames in both directions
//! - **Traits**: `TokenVerifier`, `ClassRoster`, `EnrollmentStore`
//! - **Errors**: `thiserror` taxonomy
//! - **Retry**: reconnect backoff math
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod enrollment;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod topic;
pub mod traits;

pub use enrollment::{Decision, Enrollment, EnrollmentStatus, Role, StudentProfile};
pub use envelope::{EnrollmentFact, Envelope, EventType};
pub use errors::{
    AuthError, AuthorizationError, CoreError, EnrollmentError, StaleEventError, TransportError,
};
pub use ids::{ClassId, EnrollmentId, EventId, SessionId, UserId};
pub use topic::TopicKey;
pub use traits::{ClassRoster, EnrollmentStore, Identity, Snapshot, TokenVerifier};
