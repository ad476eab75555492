//! Purpose: Define the stable public Rust API boundary for phlog.
//! Exports: Entry model, repository, cursor, migrator, and error types.
//! Role: Public, additive-only surface; hides storage internals.
//! Invariants: This module is the only public path to storage primitives.

mod config;
mod phlog;

pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::cursor::{DEFAULT_PAGE_SIZE, ResultSet};
pub use crate::core::entry::{EntryKey, LogEntry};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::migrate::{
    LEDGER_TABLE, MigrateReport, Migration, MigrationInfo, MigrationState, Migrator, Version,
};
pub use crate::core::source::{ConnectionSource, SqliteSource};
pub use crate::core::status_map::{self, StatusMap};
pub use crate::core::timestamp::{format_rfc3339, parse_rfc3339};
pub use config::PhLogConfig;
pub use phlog::{ApiResult, DEFAULT_SAFETY_MARGIN, PhLog};
