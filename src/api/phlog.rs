//! Purpose: Public change-log repository over one SQLite connection.
//! Exports: `PhLog`.
//! Role: Write path (upserts that stamp modification times), point lookups,
//! and range reads through the bounded cursor.
//! Invariants: `time_of_last_modification` is assigned here and nowhere else.
//! Invariants: Per key the stored time strictly advances on every write.
//! Invariants: Writes need `&mut self`, so no write can run inside an open cursor.
#![allow(clippy::result_large_err)]

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, params};
use time::OffsetDateTime;

use super::config::PhLogConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::core::cursor::{DEFAULT_PAGE_SIZE, ResultSet, entry_from_row};
use crate::core::entry::{EntryKey, LogEntry};
use crate::core::error::{Error, ErrorKind};
use crate::core::migrate::MigrateReport;
use crate::core::source::{ConnectionSource, sql_error};
use crate::core::{status_map, timestamp};

pub type ApiResult<T> = Result<T, Error>;

pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(5);

const UPSERT: &str = "INSERT INTO entry
    (agency_id, bibliographic_record_id, deleted, holdings_status_map, time_of_last_modification)
 VALUES (?1, ?2, ?3, ?4, ?5)
 ON CONFLICT (agency_id, bibliographic_record_id) DO UPDATE SET
    deleted = excluded.deleted,
    holdings_status_map = excluded.holdings_status_map,
    time_of_last_modification = MAX(excluded.time_of_last_modification,
                                    entry.time_of_last_modification + 1)
 RETURNING agency_id, bibliographic_record_id, deleted, holdings_status_map,
           time_of_last_modification";

const FIND_BY_KEY: &str = "SELECT agency_id, bibliographic_record_id, deleted, holdings_status_map,
        time_of_last_modification
 FROM entry
 WHERE agency_id = ?1 AND bibliographic_record_id = ?2";

#[derive(Debug)]
pub struct PhLog {
    conn: Connection,
    clock: Arc<dyn Clock>,
    page_size: usize,
    safety_margin: Duration,
}

impl PhLog {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            clock: Arc::new(SystemClock),
            page_size: DEFAULT_PAGE_SIZE,
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }

    /// Opens a connection as configured. The schema must already be migrated.
    pub fn open(config: &PhLogConfig) -> ApiResult<Self> {
        config.validate()?;
        let conn = config.source().connect()?;
        Ok(Self::new(conn)
            .with_page_size(config.page_size)
            .with_safety_margin(config.safety_margin))
    }

    /// Migrates the configured database to the latest version, then opens it.
    pub fn open_migrated(config: &PhLogConfig) -> ApiResult<(Self, MigrateReport)> {
        config.validate()?;
        let source = config.source();
        let report = config.migrator()?.migrate(&source)?;
        let phlog = Self::new(source.connect()?)
            .with_page_size(config.page_size)
            .with_safety_margin(config.safety_margin);
        Ok((phlog, report))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_safety_margin(mut self, safety_margin: Duration) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Inserts or updates the entry for its key and returns the stored row.
    ///
    /// Any modification time on `entry` is ignored; the stored value is the
    /// current clock reading, or one microsecond past the previous value for
    /// this key if the clock has not moved beyond it.
    pub fn upsert(&mut self, entry: &LogEntry) -> ApiResult<LogEntry> {
        let now = timestamp::to_micros(self.clock.now())?;
        write_entry(&self.conn, entry, now)
    }

    /// Upserts every entry in one transaction; either all are written or none.
    pub fn upsert_all<'a, I>(&mut self, entries: I) -> ApiResult<Vec<LogEntry>>
    where
        I: IntoIterator<Item = &'a LogEntry>,
    {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| sql_error(err, "failed to begin write transaction"))?;
        let mut stored = Vec::new();
        for entry in entries {
            let now = timestamp::to_micros(self.clock.now())?;
            stored.push(write_entry(&tx, entry, now)?);
        }
        tx.commit()
            .map_err(|err| sql_error(err, "failed to commit write transaction"))?;
        tracing::debug!(count = stored.len(), "upserted entry batch");
        Ok(stored)
    }

    /// Current row for `key`, or `None` when the key has never been written.
    pub fn find_by_key(&self, key: &EntryKey) -> ApiResult<Option<LogEntry>> {
        let mut stmt = self
            .conn
            .prepare_cached(FIND_BY_KEY)
            .map_err(|err| sql_error(err, "failed to prepare lookup").with_key(key))?;
        let mut rows = stmt
            .query(params![key.agency_id(), key.bibliographic_record_id()])
            .map_err(|err| sql_error(err, "failed to look up entry").with_key(key))?;
        match rows
            .next()
            .map_err(|err| sql_error(err, "failed to look up entry").with_key(key))?
        {
            Some(row) => Ok(Some(entry_from_row(row)?.0)),
            None => Ok(None),
        }
    }

    /// Like [`PhLog::find_by_key`], but a miss is a `NotFound` error.
    pub fn get(&self, key: &EntryKey) -> ApiResult<LogEntry> {
        self.find_by_key(key)?.ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("no entry for key")
                .with_key(key)
        })
    }

    /// Entries with `after <= time_of_last_modification < before`.
    ///
    /// The returned result set must be closed (or dropped) before this log
    /// can be written to again.
    pub fn entries_modified_between(
        &self,
        after: OffsetDateTime,
        before: OffsetDateTime,
    ) -> ApiResult<ResultSet<'_>> {
        let after = timestamp::bound_micros(after)?;
        let before = timestamp::bound_micros(before)?;
        ResultSet::open(&self.conn, after, before, self.page_size)
    }

    /// Upper bound for a live tailing read: now minus the safety margin.
    ///
    /// Rows committing while a read runs may carry times just below "now";
    /// stopping short of it keeps such rows for the next window instead of
    /// skipping them.
    pub fn settled_before(&self) -> OffsetDateTime {
        self.clock.now() - self.safety_margin
    }
}

fn write_entry(conn: &Connection, entry: &LogEntry, now_micros: i64) -> ApiResult<LogEntry> {
    let key = entry.key();
    let status_json = status_map::marshal_column(entry.holdings_status_map())
        .map_err(|err| err.with_key(key))?;

    let mut stmt = conn
        .prepare_cached(UPSERT)
        .map_err(|err| sql_error(err, "failed to prepare upsert").with_key(key))?;
    let mut rows = stmt
        .query(params![
            key.agency_id(),
            key.bibliographic_record_id(),
            entry.deleted(),
            status_json,
            now_micros
        ])
        .map_err(|err| sql_error(err, "failed to upsert entry").with_key(key))?;
    let stored = match rows
        .next()
        .map_err(|err| sql_error(err, "failed to upsert entry").with_key(key))?
    {
        Some(row) => entry_from_row(row)?.0,
        None => {
            return Err(Error::new(ErrorKind::Internal)
                .with_message("upsert returned no row")
                .with_key(key));
        }
    };
    // Step to completion so an autocommit write commits before returning.
    rows.next()
        .map_err(|err| sql_error(err, "failed to upsert entry").with_key(key))?;
    tracing::trace!(key = %key, deleted = stored.deleted(), "upserted entry");
    Ok(stored)
}
