// Paged, forward-only cursor over entries modified in a half-open time window.
use std::collections::VecDeque;

use rusqlite::{Connection, Row, params};

use crate::core::entry::{EntryKey, LogEntry};
use crate::core::error::{Error, ErrorKind};
use crate::core::source::sql_error;
use crate::core::status_map;
use crate::core::timestamp;

pub const DEFAULT_PAGE_SIZE: usize = 50;

const FIRST_PAGE: &str = "SELECT agency_id, bibliographic_record_id, deleted, holdings_status_map,
        time_of_last_modification
 FROM entry
 WHERE time_of_last_modification >= ?1 AND time_of_last_modification < ?2
 ORDER BY time_of_last_modification, agency_id, bibliographic_record_id
 LIMIT ?3";

const NEXT_PAGE: &str = "SELECT agency_id, bibliographic_record_id, deleted, holdings_status_map,
        time_of_last_modification
 FROM entry
 WHERE time_of_last_modification >= ?1 AND time_of_last_modification < ?2
   AND (time_of_last_modification, agency_id, bibliographic_record_id) > (?4, ?5, ?6)
 ORDER BY time_of_last_modification, agency_id, bibliographic_record_id
 LIMIT ?3";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CursorState {
    Open,
    Failed,
    Released,
}

/// Last row handed out, used to resume the next page after it.
#[derive(Debug)]
struct PagePosition {
    time_of_last_modification: i64,
    agency_id: i32,
    bibliographic_record_id: String,
}

/// One-time iteration over entries with `after <= time_of_last_modification < before`.
///
/// The cursor holds a read transaction on its connection for its lifetime, so
/// every page comes from the same snapshot, taken when the first page is
/// fetched. Rows arrive in ascending `(time_of_last_modification, agency_id,
/// bibliographic_record_id)` order, at most `page_size` of them buffered at a
/// time. Yielded entries are owned copies; nothing is retained after they are
/// handed out.
///
/// The read transaction is released by [`ResultSet::close`], by exhausting the
/// cursor, or on drop. While a result set is open its connection cannot open
/// another one.
#[derive(Debug)]
pub struct ResultSet<'c> {
    conn: &'c Connection,
    after: i64,
    before: i64,
    page_size: usize,
    buffer: VecDeque<LogEntry>,
    last: Option<PagePosition>,
    position: u64,
    exhausted: bool,
    state: CursorState,
    peak_buffered: usize,
}

impl<'c> ResultSet<'c> {
    pub(crate) fn open(
        conn: &'c Connection,
        after: i64,
        before: i64,
        page_size: usize,
    ) -> Result<Self, Error> {
        if page_size == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("page size must be positive"));
        }
        if after > before {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("range lower bound is after its upper bound")
                .with_hint("Pass `after` <= `before`; the window is [after, before)."));
        }
        if !conn.is_autocommit() {
            return Err(Error::new(ErrorKind::ResourceExhausted)
                .with_message("connection already has an open cursor or transaction")
                .with_hint("Close the previous result set before opening another one."));
        }
        conn.execute_batch("BEGIN DEFERRED")
            .map_err(|err| sql_error(err, "failed to open range cursor"))?;

        tracing::debug!(after, before, page_size, "opened range cursor");
        Ok(Self {
            conn,
            after,
            before,
            page_size,
            buffer: VecDeque::with_capacity(page_size),
            last: None,
            position: 0,
            exhausted: false,
            state: CursorState::Open,
            peak_buffered: 0,
        })
    }

    /// Next entry, fetching a page from storage when the buffer is drained.
    pub fn next_entry(&mut self) -> Result<Option<LogEntry>, Error> {
        if self.state != CursorState::Open {
            return Ok(None);
        }

        if self.position % self.page_size as u64 == 0 {
            // Page boundary: whatever the previous page held is gone before
            // the next one is read.
            self.buffer.clear();
            if !self.exhausted {
                if let Err(err) = self.fetch_page() {
                    self.state = CursorState::Failed;
                    let _ = self.release();
                    return Err(err);
                }
            }
        }

        match self.buffer.pop_front() {
            Some(entry) => {
                self.position += 1;
                Ok(Some(entry))
            }
            None => {
                self.release()?;
                Ok(None)
            }
        }
    }

    /// Number of rows yielded so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Rows currently held in the page buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Largest buffer occupancy observed over the cursor's lifetime.
    pub fn peak_buffered(&self) -> usize {
        self.peak_buffered
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_closed(&self) -> bool {
        self.state == CursorState::Released
    }

    /// Releases the read transaction. Safe to call repeatedly and after a failed fetch.
    pub fn close(&mut self) -> Result<(), Error> {
        self.release()
    }

    fn fetch_page(&mut self) -> Result<(), Error> {
        let limit = i64::try_from(self.page_size).unwrap_or(i64::MAX);
        let sql = if self.last.is_some() { NEXT_PAGE } else { FIRST_PAGE };
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .map_err(|err| sql_error(err, "failed to prepare range query"))?;

        let mut rows = match &self.last {
            Some(last) => stmt.query(params![
                self.after,
                self.before,
                limit,
                last.time_of_last_modification,
                last.agency_id,
                last.bibliographic_record_id
            ]),
            None => stmt.query(params![self.after, self.before, limit]),
        }
        .map_err(|err| sql_error(err, "failed to fetch range page"))?;

        let mut fetched = 0usize;
        while let Some(row) = rows
            .next()
            .map_err(|err| sql_error(err, "failed to fetch range page"))?
        {
            let (entry, stored_micros) = entry_from_row(row)?;
            self.last = Some(PagePosition {
                time_of_last_modification: stored_micros,
                agency_id: entry.key().agency_id(),
                bibliographic_record_id: entry.key().bibliographic_record_id().to_string(),
            });
            self.buffer.push_back(entry);
            fetched += 1;
        }

        self.peak_buffered = self.peak_buffered.max(self.buffer.len());
        if fetched < self.page_size {
            self.exhausted = true;
        }
        tracing::trace!(fetched, position = self.position, "fetched range page");
        Ok(())
    }

    fn release(&mut self) -> Result<(), Error> {
        if self.state == CursorState::Released {
            return Ok(());
        }
        self.state = CursorState::Released;
        self.buffer = VecDeque::new();
        tracing::debug!(position = self.position, "closed range cursor");

        if self.conn.is_autocommit() {
            // The transaction already ended, e.g. rolled back by a storage failure.
            return Ok(());
        }
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|err| sql_error(err, "failed to release range cursor"))
    }
}

impl Iterator for ResultSet<'_> {
    type Item = Result<LogEntry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl Drop for ResultSet<'_> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Decodes one `entry` row; also returns the raw stored timestamp.
pub(crate) fn entry_from_row(row: &Row<'_>) -> Result<(LogEntry, i64), Error> {
    let read = |err| sql_error(err, "failed to decode entry row");
    let agency_id: i32 = row.get(0).map_err(read)?;
    let bibliographic_record_id: String = row.get(1).map_err(read)?;
    let deleted: bool = row.get(2).map_err(read)?;
    let status_json: Option<String> = row.get(3).map_err(read)?;
    let stored_micros: i64 = row.get(4).map_err(read)?;

    let key = EntryKey::new(agency_id, bibliographic_record_id);
    let holdings_status_map = status_map::unmarshal_column(status_json.as_deref())
        .map_err(|err| err.with_key(&key))?;
    let time_of_last_modification =
        timestamp::from_micros(stored_micros).map_err(|err| err.with_key(&key))?;

    Ok((
        LogEntry::from_row(key, deleted, holdings_status_map, time_of_last_modification),
        stored_micros,
    ))
}

#[cfg(test)]
mod tests {
    use super::ResultSet;
    use crate::core::error::ErrorKind;
    use crate::core::migrate::Migrator;
    use rusqlite::{Connection, params};

    fn migrated() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open");
        Migrator::bundled()
            .expect("bundled")
            .migrate_connection(&mut conn)
            .expect("migrate");
        conn
    }

    fn insert(conn: &Connection, record: &str, micros: i64, status: Option<&str>) {
        conn.execute(
            "INSERT INTO entry (agency_id, bibliographic_record_id, deleted,
                                holdings_status_map, time_of_last_modification)
             VALUES (870970, ?1, 0, ?2, ?3)",
            params![record, status, micros],
        )
        .expect("insert");
    }

    #[test]
    fn pages_are_fetched_lazily_and_buffer_stays_bounded() {
        let conn = migrated();
        for i in 0..25 {
            insert(&conn, &format!("rec{i:02}"), 1_000 + i, None);
        }

        let mut cursor = ResultSet::open(&conn, 0, i64::MAX, 10).expect("open");
        assert_eq!(cursor.buffered(), 0);
        let first = cursor.next_entry().expect("next").expect("entry");
        assert_eq!(first.key().bibliographic_record_id(), "rec00");
        assert_eq!(cursor.buffered(), 9);

        let mut seen = 1;
        while let Some(_entry) = cursor.next_entry().expect("next") {
            seen += 1;
            assert!(cursor.buffered() < 10);
        }
        assert_eq!(seen, 25);
        assert_eq!(cursor.peak_buffered(), 10);
        assert!(cursor.is_closed());
    }

    #[test]
    fn exact_page_multiple_terminates() {
        let conn = migrated();
        for i in 0..20 {
            insert(&conn, &format!("rec{i:02}"), 1_000 + i, None);
        }
        let cursor = ResultSet::open(&conn, 0, i64::MAX, 10).expect("open");
        let entries = cursor.collect::<Result<Vec<_>, _>>().expect("collect");
        assert_eq!(entries.len(), 20);
    }

    #[test]
    fn equal_timestamps_are_not_skipped_across_pages() {
        let conn = migrated();
        for i in 0..7 {
            insert(&conn, &format!("rec{i}"), 5_000, None);
        }
        let cursor = ResultSet::open(&conn, 5_000, 5_001, 3).expect("open");
        let entries = cursor.collect::<Result<Vec<_>, _>>().expect("collect");
        assert_eq!(entries.len(), 7);
    }

    #[test]
    fn invalid_arguments_are_usage_errors() {
        let conn = migrated();
        let err = ResultSet::open(&conn, 0, 10, 0).expect_err("page size");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = ResultSet::open(&conn, 10, 0, 5).expect_err("inverted");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn second_cursor_on_same_connection_is_refused() {
        let conn = migrated();
        let _open = ResultSet::open(&conn, 0, 10, 5).expect("first");
        let err = ResultSet::open(&conn, 0, 10, 5).expect_err("second");
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn close_is_idempotent_and_frees_the_connection() {
        let conn = migrated();
        insert(&conn, "a", 1, None);
        let mut cursor = ResultSet::open(&conn, 0, 10, 5).expect("open");
        assert!(cursor.next_entry().expect("next").is_some());
        cursor.close().expect("close");
        cursor.close().expect("close again");
        assert!(cursor.next_entry().expect("after close").is_none());
        drop(cursor);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn corrupt_payload_fails_the_read_and_releases() {
        let conn = migrated();
        insert(&conn, "bad", 1, Some("not json"));
        let mut cursor = ResultSet::open(&conn, 0, 10, 5).expect("open");
        let err = cursor.next_entry().expect_err("decode");
        assert_eq!(err.kind(), ErrorKind::Serialization);
        assert_eq!(err.key(), Some("870970:bad"));
        assert!(cursor.next().is_none());
        cursor.close().expect("close after failure");
        assert!(conn.is_autocommit());
    }
}
