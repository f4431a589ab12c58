//! SQL DDL for the rollcall database.
//! WAL mode + foreign keys enabled at connection time.

/// Bumped whenever `CREATE_TABLES` changes shape.
pub const SCHEMA_VERSION: u32 = 1;

/// Idempotent table and index creation.
///
/// `idx_enrollments_one_pending` enforces at most one `PENDING` row per
/// (student, class) even if two writers bypass the application check.
pub const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS enrollments (
    id TEXT PRIMARY KEY,
    class_id TEXT NOT NULL,
    student_id TEXT NOT NULL,
    student_name TEXT NOT NULL,
    student_email TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('PENDING', 'APPROVED', 'REJECTED')),
    requested_at TEXT NOT NULL,
    decided_at TEXT,
    decided_by TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_enrollments_one_pending
    ON enrollments(student_id, class_id) WHERE status = 'PENDING';
CREATE INDEX IF NOT EXISTS idx_enrollments_class ON enrollments(class_id, status);
CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id);

CREATE TABLE IF NOT EXISTS class_owners (
    class_id TEXT NOT NULL,
    teacher_id TEXT NOT NULL,
    added_at TEXT NOT NULL,
    PRIMARY KEY (class_id, teacher_id)
);

CREATE INDEX IF NOT EXISTS idx_class_owners_teacher ON class_owners(teacher_id);

CREATE TABLE IF NOT EXISTS enrollment_changes (
    change_id INTEGER PRIMARY KEY AUTOINCREMENT,
    enrollment_id TEXT NOT NULL REFERENCES enrollments(id),
    kind TEXT NOT NULL,
    snapshot TEXT NOT NULL,
    occurred_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_changes_enrollment ON enrollment_changes(enrollment_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
";

/// Connection pragmas.
pub const PRAGMAS: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
";
