//! Shared `SQLite` connection and schema bootstrap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// Thread-safe `SQLite` connection wrapper.
///
/// Cloning shares the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        let conn = Connection::open(path)?;
        initialize(&conn)?;

        info!(path = %path.display(), "database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        })
    }

    /// Open an in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        initialize(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Open `path`, treating the literal `:memory:` as an in-memory database.
    pub fn open_or_memory(path: &str) -> Result<Self, StoreError> {
        if path == ":memory:" {
            Self::in_memory()
        } else {
            Self::open(Path::new(path))
        }
    }

    /// Execute a closure with the database connection held.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Where the database lives.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn initialize(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(schema::PRAGMAS)
        .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
    conn.execute_batch(schema::CREATE_TABLES)
        .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    match version {
        None => {
            let _ = conn
                .execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    [schema::SCHEMA_VERSION],
                )
                .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
        }
        Some(v) if v > schema::SCHEMA_VERSION => {
            return Err(StoreError::Database(format!(
                "database schema {v} is newer than supported {}",
                schema::SCHEMA_VERSION
            )));
        }
        Some(_) => {}
    }
    Ok(())
}
