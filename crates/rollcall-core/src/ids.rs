//! Branded ID newtypes for type safety.
//!
//! Every entity the notification core touches has a distinct ID type
//! implemented as a newtype wrapper around `String`, so a class ID can never
//! be passed where a user ID is expected.
//!
//! IDs minted here are UUID v7 (time-ordered) generated via
//! [`uuid::Uuid::now_v7`]. IDs that come from external systems (users,
//! classes) are accepted verbatim through [`From<String>`] / `From<&str>`.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generate a new UUID v7 string (time-ordered).
fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(
    /// Identifies one enrollment record in the enrollment store.
    EnrollmentId
);
branded_id!(
    /// Identifies a user (student or teacher) as issued by the auth service.
    UserId
);
branded_id!(
    /// Identifies a class as issued by the roster service.
    ClassId
);
branded_id!(
    /// Identifies one live, authenticated connection.
    SessionId
);
branded_id!(
    /// Identifies one pushed envelope; used by clients for deduplication.
    EventId
);
