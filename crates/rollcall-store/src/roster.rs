//! Class ownership. A class may have several co-owning teachers.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{instrument, warn};

use rollcall_core::ids::{ClassId, UserId};
use rollcall_core::traits::ClassRoster;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::format_time;

/// Repository over the `class_owners` table.
#[derive(Clone)]
pub struct RosterRepo {
    db: Database,
}

impl RosterRepo {
    /// Create a repository on `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Grant `teacher` ownership of `class`. Idempotent.
    #[instrument(skip(self), fields(class_id = %class, teacher_id = %teacher))]
    pub fn add_owner(&self, class: &ClassId, teacher: &UserId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT OR IGNORE INTO class_owners (class_id, teacher_id, added_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![class.as_str(), teacher.as_str(), format_time(Utc::now())],
            )?;
            Ok(())
        })
    }

    /// Revoke ownership. Returns whether a row was removed.
    #[instrument(skip(self), fields(class_id = %class, teacher_id = %teacher))]
    pub fn remove_owner(&self, class: &ClassId, teacher: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM class_owners WHERE class_id = ?1 AND teacher_id = ?2",
                [class.as_str(), teacher.as_str()],
            )?;
            Ok(removed > 0)
        })
    }

    /// Whether `teacher` owns `class`.
    pub fn owns(&self, teacher: &UserId, class: &ClassId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM class_owners WHERE class_id = ?1 AND teacher_id = ?2",
                [class.as_str(), teacher.as_str()],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    /// Classes owned by `teacher`, sorted.
    pub fn classes_of(&self, teacher: &UserId) -> Result<Vec<ClassId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT class_id FROM class_owners WHERE teacher_id = ?1 ORDER BY class_id",
            )?;
            let classes = stmt
                .query_map([teacher.as_str()], |row| row.get::<_, String>(0))?
                .map(|r| r.map(ClassId::from))
                .collect::<Result<_, _>>()?;
            Ok(classes)
        })
    }
}

#[async_trait]
impl ClassRoster for RosterRepo {
    async fn is_owner(&self, teacher: &UserId, class: &ClassId) -> bool {
        // Fail closed: a storage error denies access.
        self.owns(teacher, class).unwrap_or_else(|e| {
            warn!(error = %e, class_id = %class, "ownership lookup failed");
            false
        })
    }
}
