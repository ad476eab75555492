// Connection source for the SQLite database file, and SQLite error classification.
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OpenFlags};

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Supplies ready-to-use storage connections.
pub trait ConnectionSource: Debug + Send + Sync {
    fn connect(&self) -> Result<Connection, Error>;

    /// Human-readable location used in error context.
    fn describe(&self) -> String;
}

#[derive(Clone, Debug)]
pub struct SqliteSource {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionSource for SqliteSource {
    fn connect(&self) -> Result<Connection, Error> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(&self.path, flags).map_err(|err| {
            sql_error(err, "failed to open database").with_path(&self.path)
        })?;

        conn.busy_timeout(self.busy_timeout)
            .map_err(|err| sql_error(err, "failed to set busy timeout").with_path(&self.path))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .map_err(|err| sql_error(err, "failed to enable WAL").with_path(&self.path))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")
            .map_err(|err| sql_error(err, "failed to set synchronous").with_path(&self.path))?;

        tracing::debug!(path = %self.path.display(), "opened phlog connection");
        Ok(conn)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

pub(crate) fn sqlite_error_kind(err: &rusqlite::Error) -> ErrorKind {
    match err.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::OutOfMemory
            | ErrorCode::DiskFull,
        ) => ErrorKind::ResourceExhausted,
        _ => ErrorKind::Storage,
    }
}

pub(crate) fn sql_error(err: rusqlite::Error, message: &str) -> Error {
    Error::new(sqlite_error_kind(&err))
        .with_message(message)
        .with_source(err)
}
