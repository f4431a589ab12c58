//! Store error type.

use rollcall_core::errors::EnrollmentError;

/// Everything a repository call can fail with.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `SQLite` reported an error.
    #[error("database error: {0}")]
    Database(String),

    /// Lookup by key found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored value could not be decoded.
    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        /// Table name.
        table: &'static str,
        /// Column name.
        column: &'static str,
        /// Decoder message.
        detail: String,
    },

    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem failure while opening the database.
    #[error("IO error: {0}")]
    Io(String),

    /// An enrollment business rule refused the write.
    #[error(transparent)]
    Rule(#[from] EnrollmentError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for EnrollmentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Rule(rule) => rule,
            other => EnrollmentError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::ids::EnrollmentId;

    #[test]
    fn rule_errors_pass_through() {
        let err = StoreError::from(EnrollmentError::NotFound(EnrollmentId::from("e1")));
        assert_eq!(
            EnrollmentError::from(err),
            EnrollmentError::NotFound(EnrollmentId::from("e1"))
        );
    }

    #[test]
    fn infrastructure_errors_become_storage() {
        let err = StoreError::Database("disk I/O error".into());
        assert!(matches!(
            EnrollmentError::from(err),
            EnrollmentError::Storage(msg) if msg.contains("disk I/O")
        ));
    }
}
