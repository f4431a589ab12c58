//! Enrollment records and the state machine that guards them.
//!
//! `PENDING → APPROVED | REJECTED`, nothing else. [`EnrollmentRepo::decide`]
//! is a compare-and-swap on `status = 'PENDING'`, so of any number of
//! concurrent deciders exactly one commits and the rest learn the winning
//! status.
//!
//! Every committed mutation appends a row to `enrollment_changes` in the
//! same transaction and is then published on the change feed as an
//! [`EnrollmentFact`]. Publishing happens while the connection lock is still
//! held, so feed order equals commit order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use rollcall_core::enrollment::{Decision, Enrollment, EnrollmentStatus, StudentProfile};
use rollcall_core::envelope::{EnrollmentFact, EventType};
use rollcall_core::errors::EnrollmentError;
use rollcall_core::ids::{ClassId, EnrollmentId, UserId};
use rollcall_core::traits::{EnrollmentStore, Snapshot};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_time, parse_time};

/// Default change feed depth.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

const COLUMNS: &str = "id, class_id, student_id, student_name, student_email, status, \
                       requested_at, decided_at, decided_by";

/// Enrollment repository with an attached change feed.
pub struct EnrollmentRepo {
    db: Database,
    feed: broadcast::Sender<EnrollmentFact>,
}

impl EnrollmentRepo {
    /// Create a repository with the default feed capacity.
    pub fn new(db: Database) -> Self {
        Self::with_feed_capacity(db, DEFAULT_FEED_CAPACITY)
    }

    /// Create a repository whose change feed buffers `capacity` facts per
    /// subscriber before lagging.
    pub fn with_feed_capacity(db: Database, capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self { db, feed }
    }

    /// Subscribe to committed changes from now on.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<EnrollmentFact> {
        self.feed.subscribe()
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Create a `PENDING` enrollment for `student` in `class`.
    ///
    /// Fails with `AlreadyPending` or `AlreadyEnrolled` when the student
    /// already has a live or approved enrollment for the class. A previously
    /// rejected student may request again.
    #[instrument(skip(self, student), fields(student_id = %student.student_id, class_id = %class))]
    pub fn request_enrollment(
        &self,
        student: &StudentProfile,
        class: &ClassId,
    ) -> Result<Enrollment, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            if let Some(err) = blocking_enrollment(&tx, &student.student_id, class)? {
                return Err(err.into());
            }

            let enrollment = Enrollment {
                enrollment_id: EnrollmentId::new(),
                class_id: class.clone(),
                student_id: student.student_id.clone(),
                student_name: student.name.clone(),
                student_email: student.email.clone(),
                status: EnrollmentStatus::Pending,
                requested_at: Utc::now(),
                decided_at: None,
                decided_by: None,
            };

            let inserted = tx.execute(
                "INSERT INTO enrollments (id, class_id, student_id, student_name, student_email,
                                          status, requested_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6)",
                rusqlite::params![
                    enrollment.enrollment_id.as_str(),
                    class.as_str(),
                    student.student_id.as_str(),
                    student.name,
                    student.email,
                    format_time(enrollment.requested_at),
                ],
            );
            if let Err(e) = inserted {
                // Another writer on a separate connection won the partial
                // unique index.
                if is_unique_violation(&e) {
                    if let Some(err) = blocking_enrollment(&tx, &student.student_id, class)? {
                        return Err(err.into());
                    }
                }
                return Err(e.into());
            }

            let fact = record_change(&tx, EventType::NewEnrollment, &enrollment)?;
            tx.commit()?;
            debug!(enrollment_id = %enrollment.enrollment_id, change_id = fact.change_id, "enrollment requested");
            self.publish(fact);
            Ok(enrollment)
        })
    }

    /// Commit a terminal decision if, and only if, the enrollment is still
    /// `PENDING`.
    ///
    /// The loser of a race gets `AlreadyDecided` carrying the status the
    /// winner wrote.
    #[instrument(skip(self), fields(enrollment_id = %id, decision = %decision, decided_by = %decided_by))]
    pub fn decide(
        &self,
        id: &EnrollmentId,
        decision: Decision,
        decided_by: &UserId,
    ) -> Result<Enrollment, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let target = decision.target_status();
            let now = Utc::now();

            let swapped = tx.execute(
                "UPDATE enrollments SET status = ?1, decided_at = ?2, decided_by = ?3
                 WHERE id = ?4 AND status = 'PENDING'",
                rusqlite::params![
                    target.as_str(),
                    format_time(now),
                    decided_by.as_str(),
                    id.as_str(),
                ],
            )?;

            if swapped == 0 {
                let actual: Option<String> = tx
                    .query_row(
                        "SELECT status FROM enrollments WHERE id = ?1",
                        [id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(match actual {
                    Some(raw) => EnrollmentError::AlreadyDecided {
                        enrollment_id: id.clone(),
                        final_status: row_helpers::parse_enum(&raw, "enrollments", "status")?,
                    },
                    None => EnrollmentError::NotFound(id.clone()),
                }
                .into());
            }

            let enrollment = select_one(&tx, id)?;
            let kind = match decision {
                Decision::Approved => EventType::EnrollmentAccepted,
                Decision::Rejected => EventType::EnrollmentRejected,
            };
            let fact = record_change(&tx, kind, &enrollment)?;
            tx.commit()?;
            debug!(change_id = fact.change_id, status = %enrollment.status, "enrollment decided");
            self.publish(fact);
            Ok(enrollment)
        })
    }

    fn publish(&self, fact: EnrollmentFact) {
        // No receivers is fine: the outbox row is the durable record.
        if self.feed.send(fact).is_err() {
            debug!("change feed has no subscribers");
        }
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Get an enrollment by ID.
    #[instrument(skip(self), fields(enrollment_id = %id))]
    pub fn get(&self, id: &EnrollmentId) -> Result<Enrollment, StoreError> {
        self.db.with_conn(|conn| select_one(conn, id))
    }

    /// Pending enrollments of a class, oldest request first.
    #[instrument(skip(self), fields(class_id = %class))]
    pub fn list_pending(&self, class: &ClassId) -> Result<Vec<Enrollment>, StoreError> {
        self.db.with_conn(|conn| {
            select_many(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM enrollments
                     WHERE class_id = ?1 AND status = 'PENDING' ORDER BY requested_at"
                ),
                class.as_str(),
            )
        })
    }

    /// All enrollments of a class, oldest request first.
    #[instrument(skip(self), fields(class_id = %class))]
    pub fn list_for_class(&self, class: &ClassId) -> Result<Vec<Enrollment>, StoreError> {
        self.db.with_conn(|conn| class_rows(conn, class))
    }

    /// All enrollments of a student across classes, oldest request first.
    #[instrument(skip(self), fields(student_id = %student))]
    pub fn list_for_student(&self, student: &UserId) -> Result<Vec<Enrollment>, StoreError> {
        self.db.with_conn(|conn| student_rows(conn, student))
    }

    /// Status of the student's most recent request for the class.
    #[instrument(skip(self), fields(student_id = %student, class_id = %class))]
    pub fn get_status(
        &self,
        student: &UserId,
        class: &ClassId,
    ) -> Result<Option<EnrollmentStatus>, StoreError> {
        self.db.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT status FROM enrollments WHERE student_id = ?1 AND class_id = ?2
                     ORDER BY requested_at DESC, rowid DESC LIMIT 1",
                    [student.as_str(), class.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|s| row_helpers::parse_enum(&s, "enrollments", "status"))
                .transpose()
        })
    }

    /// All class enrollments plus the server clock they reflect.
    ///
    /// The clock is read under the connection lock: every change committed
    /// before `as_of` is included, every later one has `occurred_at >= as_of`.
    pub fn snapshot_for_class(&self, class: &ClassId) -> Result<Snapshot, StoreError> {
        self.snapshot_for_classes(std::slice::from_ref(class))
    }

    /// Enrollments of every class in `classes`, read under one lock with a
    /// single `as_of`. An empty list yields an empty snapshot.
    pub fn snapshot_for_classes(&self, classes: &[ClassId]) -> Result<Snapshot, StoreError> {
        self.db.with_conn(|conn| {
            let as_of = Utc::now();
            let mut enrollments = Vec::new();
            for class in classes {
                enrollments.extend(class_rows(conn, class)?);
            }
            Ok(Snapshot { enrollments, as_of })
        })
    }

    /// All student enrollments plus the server clock they reflect.
    pub fn snapshot_for_student(&self, student: &UserId) -> Result<Snapshot, StoreError> {
        self.db.with_conn(|conn| {
            let as_of = Utc::now();
            Ok(Snapshot {
                enrollments: student_rows(conn, student)?,
                as_of,
            })
        })
    }

    /// Outbox poll: up to `limit` changes with `change_id > after`, in order.
    #[instrument(skip(self))]
    pub fn changes_since(&self, after: i64, limit: usize) -> Result<Vec<EnrollmentFact>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT change_id, kind, snapshot, occurred_at FROM enrollment_changes
                 WHERE change_id > ?1 ORDER BY change_id LIMIT ?2",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut rows = stmt.query(rusqlite::params![after, limit])?;
            let mut facts = Vec::new();
            while let Some(row) = rows.next()? {
                facts.push(row_to_fact(row)?);
            }
            Ok(facts)
        })
    }

    /// Highest committed change ID, or 0 when nothing has changed yet.
    pub fn latest_change_id(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(MAX(change_id), 0) FROM enrollment_changes",
                [],
                |row| row.get(0),
            )?)
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EnrollmentStore
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl EnrollmentStore for EnrollmentRepo {
    async fn create_enrollment(
        &self,
        student: &StudentProfile,
        class: &ClassId,
    ) -> Result<Enrollment, EnrollmentError> {
        Ok(self.request_enrollment(student, class)?)
    }

    async fn decide_enrollment(
        &self,
        id: &EnrollmentId,
        decision: Decision,
        decided_by: &UserId,
    ) -> Result<Enrollment, EnrollmentError> {
        Ok(self.decide(id, decision, decided_by)?)
    }

    async fn get(&self, id: &EnrollmentId) -> Result<Enrollment, EnrollmentError> {
        match EnrollmentRepo::get(self, id) {
            Err(StoreError::NotFound(_)) => Err(EnrollmentError::NotFound(id.clone())),
            other => Ok(other?),
        }
    }

    async fn list_pending(&self, class: &ClassId) -> Result<Vec<Enrollment>, EnrollmentError> {
        Ok(EnrollmentRepo::list_pending(self, class)?)
    }

    async fn get_status(
        &self,
        student: &UserId,
        class: &ClassId,
    ) -> Result<Option<EnrollmentStatus>, EnrollmentError> {
        Ok(EnrollmentRepo::get_status(self, student, class)?)
    }

    async fn snapshot_for_classes(&self, classes: &[ClassId]) -> Result<Snapshot, EnrollmentError> {
        Ok(EnrollmentRepo::snapshot_for_classes(self, classes)?)
    }

    async fn snapshot_for_student(&self, student: &UserId) -> Result<Snapshot, EnrollmentError> {
        Ok(EnrollmentRepo::snapshot_for_student(self, student)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

/// A live or approved enrollment that blocks a new request, as an error.
fn blocking_enrollment(
    conn: &Connection,
    student: &UserId,
    class: &ClassId,
) -> Result<Option<EnrollmentError>, StoreError> {
    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT id, status FROM enrollments
             WHERE student_id = ?1 AND class_id = ?2 AND status IN ('PENDING', 'APPROVED')
             ORDER BY requested_at DESC LIMIT 1",
            [student.as_str(), class.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    Ok(existing.map(|(id, status)| {
        let existing = EnrollmentId::from(id);
        if status == EnrollmentStatus::Approved.as_str() {
            EnrollmentError::AlreadyEnrolled { existing }
        } else {
            EnrollmentError::AlreadyPending { existing }
        }
    }))
}

fn record_change(
    conn: &Connection,
    kind: EventType,
    enrollment: &Enrollment,
) -> Result<EnrollmentFact, StoreError> {
    let occurred_at = Utc::now();
    let _ = conn.execute(
        "INSERT INTO enrollment_changes (enrollment_id, kind, snapshot, occurred_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            enrollment.enrollment_id.as_str(),
            kind.as_str(),
            serde_json::to_string(enrollment)?,
            format_time(occurred_at),
        ],
    )?;
    Ok(EnrollmentFact {
        change_id: conn.last_insert_rowid(),
        kind,
        enrollment: enrollment.clone(),
        occurred_at,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn select_one(conn: &Connection, id: &EnrollmentId) -> Result<Enrollment, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM enrollments WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_enrollment(row),
        None => Err(StoreError::NotFound(format!("enrollment {id}"))),
    }
}

fn select_many(conn: &Connection, sql: &str, key: &str) -> Result<Vec<Enrollment>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([key])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_enrollment(row)?);
    }
    Ok(results)
}

fn class_rows(conn: &Connection, class: &ClassId) -> Result<Vec<Enrollment>, StoreError> {
    select_many(
        conn,
        &format!("SELECT {COLUMNS} FROM enrollments WHERE class_id = ?1 ORDER BY requested_at"),
        class.as_str(),
    )
}

fn student_rows(conn: &Connection, student: &UserId) -> Result<Vec<Enrollment>, StoreError> {
    select_many(
        conn,
        &format!("SELECT {COLUMNS} FROM enrollments WHERE student_id = ?1 ORDER BY requested_at"),
        student.as_str(),
    )
}

fn row_to_enrollment(row: &Row<'_>) -> Result<Enrollment, StoreError> {
    const T: &str = "enrollments";
    let status: String = row_helpers::get(row, 5, T, "status")?;
    let requested_at: String = row_helpers::get(row, 6, T, "requested_at")?;
    let decided_at: Option<String> = row_helpers::get(row, 7, T, "decided_at")?;
    let decided_by: Option<String> = row_helpers::get(row, 8, T, "decided_by")?;

    Ok(Enrollment {
        enrollment_id: EnrollmentId::from(row_helpers::get::<String>(row, 0, T, "id")?),
        class_id: ClassId::from(row_helpers::get::<String>(row, 1, T, "class_id")?),
        student_id: UserId::from(row_helpers::get::<String>(row, 2, T, "student_id")?),
        student_name: row_helpers::get(row, 3, T, "student_name")?,
        student_email: row_helpers::get(row, 4, T, "student_email")?,
        status: row_helpers::parse_enum(&status, T, "status")?,
        requested_at: parse_time(&requested_at, T, "requested_at")?,
        decided_at: decided_at
            .map(|raw| parse_time(&raw, T, "decided_at"))
            .transpose()?,
        decided_by: decided_by.map(UserId::from),
    })
}

fn row_to_fact(row: &Row<'_>) -> Result<EnrollmentFact, StoreError> {
    const T: &str = "enrollment_changes";
    let kind: String = row_helpers::get(row, 1, T, "kind")?;
    let snapshot: String = row_helpers::get(row, 2, T, "snapshot")?;
    let occurred_at: String = row_helpers::get(row, 3, T, "occurred_at")?;
    let occurred_at: DateTime<Utc> = parse_time(&occurred_at, T, "occurred_at")?;

    Ok(EnrollmentFact {
        change_id: row_helpers::get(row, 0, T, "change_id")?,
        kind: row_helpers::parse_enum(&kind, T, "kind")?,
        enrollment: row_helpers::parse_json(&snapshot, T, "snapshot")?,
        occurred_at,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use assert_matches::assert_matches;

    use super::*;

    fn repo() -> EnrollmentRepo {
        EnrollmentRepo::new(Database::in_memory().unwrap())
    }

    fn student(id: &str) -> StudentProfile {
        StudentProfile {
            student_id: UserId::from(id),
            name: format!("Student {id}"),
            email: format!("{id}@example.com"),
        }
    }

    fn class(id: &str) -> ClassId {
        ClassId::from(id)
    }

    fn teacher() -> UserId {
        UserId::from("T")
    }

    // ── request_enrollment ──────────────────────────────────────────

    #[test]
    fn request_creates_pending() {
        let repo = repo();
        let e = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Pending);
        assert_eq!(e.student_name, "Student S");
        assert_eq!(repo.get(&e.enrollment_id).unwrap(), e);
    }

    #[test]
    fn second_request_is_already_pending() {
        let repo = repo();
        let first = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        let err = repo.request_enrollment(&student("S"), &class("C")).unwrap_err();
        assert_matches!(
            err,
            StoreError::Rule(EnrollmentError::AlreadyPending { existing }) if existing == first.enrollment_id
        );
    }

    #[test]
    fn request_after_approval_is_already_enrolled() {
        let repo = repo();
        let e = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        let _ = repo.decide(&e.enrollment_id, Decision::Approved, &teacher()).unwrap();
        assert_matches!(
            repo.request_enrollment(&student("S"), &class("C")),
            Err(StoreError::Rule(EnrollmentError::AlreadyEnrolled { .. }))
        );
    }

    #[test]
    fn request_after_rejection_creates_new_enrollment() {
        let repo = repo();
        let first = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        let _ = repo.decide(&first.enrollment_id, Decision::Rejected, &teacher()).unwrap();

        let second = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        assert_ne!(first.enrollment_id, second.enrollment_id);
        assert_eq!(
            repo.get(&first.enrollment_id).unwrap().status,
            EnrollmentStatus::Rejected
        );
        assert_eq!(
            repo.get_status(&UserId::from("S"), &class("C")).unwrap(),
            Some(EnrollmentStatus::Pending)
        );
    }

    #[test]
    fn pending_in_other_class_does_not_block() {
        let repo = repo();
        let _ = repo.request_enrollment(&student("S"), &class("C1")).unwrap();
        let _ = repo.request_enrollment(&student("S"), &class("C2")).unwrap();
        assert_eq!(repo.list_for_student(&UserId::from("S")).unwrap().len(), 2);
    }

    // ── decide ──────────────────────────────────────────────────────

    #[test]
    fn decide_sets_terminal_fields() {
        let repo = repo();
        let e = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        let decided = repo.decide(&e.enrollment_id, Decision::Approved, &teacher()).unwrap();
        assert_eq!(decided.status, EnrollmentStatus::Approved);
        assert_eq!(decided.decided_by, Some(teacher()));
        assert!(decided.decided_at.is_some());
        assert_eq!(decided.requested_at, e.requested_at);
    }

    #[test]
    fn second_decision_is_already_decided_with_winner() {
        let repo = repo();
        let e = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        let _ = repo.decide(&e.enrollment_id, Decision::Rejected, &teacher()).unwrap();
        let err = repo
            .decide(&e.enrollment_id, Decision::Approved, &UserId::from("T2"))
            .unwrap_err();
        assert_matches!(
            err,
            StoreError::Rule(EnrollmentError::AlreadyDecided {
                final_status: EnrollmentStatus::Rejected,
                ..
            })
        );
        // Terminal state untouched by the loser.
        let stored = repo.get(&e.enrollment_id).unwrap();
        assert_eq!(stored.status, EnrollmentStatus::Rejected);
        assert_eq!(stored.decided_by, Some(teacher()));
    }

    #[test]
    fn decide_unknown_is_not_found() {
        let repo = repo();
        assert_matches!(
            repo.decide(&EnrollmentId::from("missing"), Decision::Approved, &teacher()),
            Err(StoreError::Rule(EnrollmentError::NotFound(_)))
        );
    }

    #[test]
    fn concurrent_decisions_have_exactly_one_winner() {
        const N: usize = 16;
        let repo = Arc::new(repo());
        let e = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        let barrier = Arc::new(Barrier::new(N));

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let repo = Arc::clone(&repo);
                let barrier = Arc::clone(&barrier);
                let id = e.enrollment_id.clone();
                std::thread::spawn(move || {
                    let decision = if i % 2 == 0 {
                        Decision::Approved
                    } else {
                        Decision::Rejected
                    };
                    let _ = barrier.wait();
                    repo.decide(&id, decision, &UserId::from(format!("T{i}")))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<&Enrollment> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        let final_status = winners[0].status;

        for r in &results {
            if let Err(err) = r {
                assert_matches!(
                    err,
                    StoreError::Rule(EnrollmentError::AlreadyDecided { final_status: s, .. }) if *s == final_status
                );
            }
        }
        assert_eq!(repo.get(&e.enrollment_id).unwrap().status, final_status);
    }

    // ── reads ───────────────────────────────────────────────────────

    #[test]
    fn list_pending_excludes_decided() {
        let repo = repo();
        let a = repo.request_enrollment(&student("A"), &class("C")).unwrap();
        let b = repo.request_enrollment(&student("B"), &class("C")).unwrap();
        let _ = repo.request_enrollment(&student("X"), &class("OTHER")).unwrap();
        let _ = repo.decide(&a.enrollment_id, Decision::Approved, &teacher()).unwrap();

        let pending = repo.list_pending(&class("C")).unwrap();
        assert_eq!(pending, vec![b]);
        assert_eq!(repo.list_for_class(&class("C")).unwrap().len(), 2);
    }

    #[test]
    fn get_status_none_when_never_requested() {
        let repo = repo();
        assert_eq!(repo.get_status(&UserId::from("S"), &class("C")).unwrap(), None);
    }

    #[test]
    fn snapshot_as_of_covers_committed_changes() {
        let repo = repo();
        let e = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        let snap = repo.snapshot_for_class(&class("C")).unwrap();
        assert_eq!(snap.enrollments, vec![e.clone()]);
        assert!(snap.as_of >= e.requested_at);

        let mine = repo.snapshot_for_student(&UserId::from("S")).unwrap();
        assert_eq!(mine.enrollments, vec![e]);
    }

    #[test]
    fn snapshot_spans_several_classes() {
        let repo = repo();
        let c = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        let d = repo.request_enrollment(&student("S"), &class("D")).unwrap();
        let _ = repo.request_enrollment(&student("S"), &class("E")).unwrap();

        let snap = repo.snapshot_for_classes(&[class("C"), class("D")]).unwrap();
        assert_eq!(snap.enrollments, vec![c, d.clone()]);
        assert!(snap.as_of >= d.requested_at);

        assert!(repo.snapshot_for_classes(&[]).unwrap().enrollments.is_empty());
    }

    // ── change feed / outbox ────────────────────────────────────────

    #[tokio::test]
    async fn feed_publishes_in_commit_order() {
        let repo = repo();
        let mut rx = repo.subscribe_changes();

        let e = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        let _ = repo.decide(&e.enrollment_id, Decision::Approved, &teacher()).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventType::NewEnrollment);
        assert_eq!(first.enrollment.status, EnrollmentStatus::Pending);
        assert_eq!(second.kind, EventType::EnrollmentAccepted);
        assert_eq!(second.enrollment.status, EnrollmentStatus::Approved);
        assert!(first.change_id < second.change_id);
    }

    #[test]
    fn failed_writes_publish_nothing() {
        let repo = repo();
        let e = repo.request_enrollment(&student("S"), &class("C")).unwrap();
        let mut rx = repo.subscribe_changes();
        let _ = repo.request_enrollment(&student("S"), &class("C")).unwrap_err();
        let _ = repo.decide(&e.enrollment_id, Decision::Rejected, &teacher()).unwrap();
        let _ = repo.decide(&e.enrollment_id, Decision::Approved, &teacher()).unwrap_err();

        assert_eq!(rx.try_recv().unwrap().kind, EventType::EnrollmentRejected);
        assert!(rx.try_recv().is_err());
        assert_eq!(repo.changes_since(0, 100).unwrap().len(), 2);
    }

    #[test]
    fn changes_since_pages_the_outbox() {
        let repo = repo();
        for s in ["A", "B", "C"] {
            let _ = repo.request_enrollment(&student(s), &class("K")).unwrap();
        }
        let all = repo.changes_since(0, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(repo.latest_change_id().unwrap(), all[2].change_id);

        let tail = repo.changes_since(all[0].change_id, 1).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].change_id, all[1].change_id);
        assert_eq!(tail[0].enrollment.student_id, UserId::from("B"));
    }

    #[tokio::test]
    async fn store_trait_maps_rule_errors() {
        let repo = repo();
        let store: &dyn EnrollmentStore = &repo;
        let e = store.create_enrollment(&student("S"), &class("C")).await.unwrap();
        assert_matches!(
            store.create_enrollment(&student("S"), &class("C")).await,
            Err(EnrollmentError::AlreadyPending { .. })
        );
        assert_matches!(
            store.get(&EnrollmentId::from("nope")).await,
            Err(EnrollmentError::NotFound(_))
        );
        let decided = store
            .decide_enrollment(&e.enrollment_id, Decision::Approved, &teacher())
            .await
            .unwrap();
        assert_eq!(decided.status, EnrollmentStatus::Approved);
        assert_eq!(store.list_pending(&class("C")).await.unwrap(), vec![]);
    }
}
