//! # rollcall-store
//!
//! `SQLite` persistence for enrollments and class ownership.
//!
//! - [`Database`]: shared connection with schema bootstrap
//! - [`EnrollmentRepo`]: the enrollment state machine, outbox and change feed
//! - [`RosterRepo`]: class ownership, implements `ClassRoster`

#![deny(unsafe_code)]

pub mod database;
pub mod enrollments;
pub mod error;
pub mod roster;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use enrollments::EnrollmentRepo;
pub use error::StoreError;
pub use roster::RosterRepo;
