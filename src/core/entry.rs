// Change-log entry model: immutable key identity plus the mutable record state.
use std::fmt;

use time::OffsetDateTime;

use crate::core::status_map::StatusMap;

/// Identity of a tracked holding. Immutable once an entry exists.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    agency_id: i32,
    bibliographic_record_id: String,
}

impl EntryKey {
    pub fn new(agency_id: i32, bibliographic_record_id: impl Into<String>) -> Self {
        Self {
            agency_id,
            bibliographic_record_id: bibliographic_record_id.into(),
        }
    }

    pub fn agency_id(&self) -> i32 {
        self.agency_id
    }

    pub fn bibliographic_record_id(&self) -> &str {
        &self.bibliographic_record_id
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.agency_id, self.bibliographic_record_id)
    }
}

/// Most recent known state of one holding.
///
/// `time_of_last_modification` has no public setter: it is `None` on entries
/// built by callers and is filled in only by the store when a row is written
/// or read back.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    key: EntryKey,
    deleted: bool,
    holdings_status_map: Option<StatusMap>,
    time_of_last_modification: Option<OffsetDateTime>,
}

impl LogEntry {
    pub fn new(key: EntryKey) -> Self {
        Self {
            key,
            deleted: false,
            holdings_status_map: None,
            time_of_last_modification: None,
        }
    }

    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    pub fn with_holdings_status_map(mut self, holdings_status_map: StatusMap) -> Self {
        self.holdings_status_map = Some(holdings_status_map);
        self
    }

    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    pub fn holdings_status_map(&self) -> Option<&StatusMap> {
        self.holdings_status_map.as_ref()
    }

    pub fn time_of_last_modification(&self) -> Option<OffsetDateTime> {
        self.time_of_last_modification
    }

    pub(crate) fn from_row(
        key: EntryKey,
        deleted: bool,
        holdings_status_map: Option<StatusMap>,
        time_of_last_modification: OffsetDateTime,
    ) -> Self {
        Self {
            key,
            deleted,
            holdings_status_map,
            time_of_last_modification: Some(time_of_last_modification),
        }
    }
}
