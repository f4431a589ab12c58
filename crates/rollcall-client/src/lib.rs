//! # rollcall-client
//!
//! Client side of the enrollment notification pipeline.
//!
//! - [`ConnectionManager`]: one live WebSocket per identity, with heartbeats,
//!   reconnect backoff and resync after every (re)connect
//! - [`HttpSnapshotSource`]: REST resync against `/api/enrollments`
//! - [`Reconciler`]: pure merge of snapshots and pushed envelopes

#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod reconciler;
pub mod snapshot;

pub use connection::{ClientConfig, ConnectionManager, ConnectionStatus};
pub use error::ClientError;
pub use reconciler::{ApplyOutcome, Notice, Reconciler, SharedReconciler};
pub use snapshot::{CredentialProvider, HttpSnapshotSource, SnapshotSource, StaticCredentials};
