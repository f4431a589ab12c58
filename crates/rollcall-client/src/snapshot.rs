//! Credential and resync seams.
//!
//! The connection manager asks a [`CredentialProvider`] for a fresh token on
//! every dial and a [`SnapshotSource`] for authoritative state after every
//! (re)connect.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument};

use rollcall_core::enrollment::Role;
use rollcall_core::errors::AuthError;
use rollcall_core::ids::UserId;
use rollcall_core::topic::TopicKey;
use rollcall_core::traits::Snapshot;

use crate::error::ClientError;

/// Source of short-lived tokens from the external auth service.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A token proving `user` holds `role`.
    async fn token(&self, user: &UserId, role: Role) -> Result<String, ClientError>;
}

/// A fixed token, for tools and tests.
#[derive(Clone, Debug)]
pub struct StaticCredentials(pub String);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn token(&self, _user: &UserId, _role: Role) -> Result<String, ClientError> {
        Ok(self.0.clone())
    }
}

/// Authoritative enrollment state for resync.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current snapshot covering every topic in `topics`.
    ///
    /// The result replaces the client cache wholesale, so it must include
    /// the records of every subscribed topic, not just one.
    async fn fetch(&self, topics: &[TopicKey]) -> Result<Snapshot, ClientError>;
}

/// [`SnapshotSource`] over `GET /api/enrollments`.
///
/// Teachers ask for all their subscribed classes in one request
/// (`classIds=C,D`), so the snapshot carries a single server `asOf`.
/// Students get their own enrollments.
pub struct HttpSnapshotSource {
    http: reqwest::Client,
    endpoint: String,
    user_id: UserId,
    role: Role,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpSnapshotSource {
    /// Resync source for `user_id` against the server at `api_url`
    /// (e.g. `http://127.0.0.1:8080`).
    pub fn new(
        api_url: &str,
        user_id: UserId,
        role: Role,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/api/enrollments", api_url.trim_end_matches('/')),
            user_id,
            role,
            credentials,
        }
    }
}

/// The `classIds` value naming every class topic in `topics`.
fn class_ids_param(topics: &[TopicKey]) -> String {
    topics
        .iter()
        .filter_map(|topic| match topic {
            TopicKey::Class(id) => Some(id.as_str()),
            TopicKey::User(_) => None,
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    #[instrument(skip_all, fields(user_id = %self.user_id, topics = topics.len()))]
    async fn fetch(&self, topics: &[TopicKey]) -> Result<Snapshot, ClientError> {
        let token = self.credentials.token(&self.user_id, self.role).await?;
        let mut request = self.http.get(&self.endpoint).bearer_auth(token);
        if self.role == Role::Teacher {
            request = request.query(&[("classIds", class_ids_param(topics))]);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected(body).into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let snapshot: Snapshot = response.json().await?;
        debug!(count = snapshot.enrollments.len(), as_of = %snapshot.as_of, "snapshot fetched");
        Ok(snapshot)
    }
}
