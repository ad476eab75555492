//! Purpose: Runtime configuration for opening and migrating a phlog database.
//! Exports: `PhLogConfig`.
//! Role: Single place where defaults live; the CLI maps flags and env onto it.
//! Invariants: `page_size` is positive; the baseline version parses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::phlog::DEFAULT_SAFETY_MARGIN;
use crate::core::cursor::DEFAULT_PAGE_SIZE;
use crate::core::error::{Error, ErrorKind};
use crate::core::migrate::{DEFAULT_BASELINE_VERSION, Migrator, Version};
use crate::core::source::{DEFAULT_BUSY_TIMEOUT, SqliteSource};

#[derive(Clone, Debug)]
pub struct PhLogConfig {
    pub database: PathBuf,
    pub busy_timeout: Duration,
    pub page_size: usize,
    pub baseline_version: String,
    pub safety_margin: Duration,
}

impl PhLogConfig {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
            baseline_version: DEFAULT_BASELINE_VERSION.to_string(),
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_baseline_version(mut self, baseline_version: impl Into<String>) -> Self {
        self.baseline_version = baseline_version.into();
        self
    }

    pub fn with_safety_margin(mut self, safety_margin: Duration) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    pub fn database(&self) -> &Path {
        &self.database
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.page_size == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("page size must be positive")
                .with_hint(format!("The default is {DEFAULT_PAGE_SIZE}.")));
        }
        self.baseline_version
            .parse::<Version>()
            .map_err(|_| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid baseline version: {}", self.baseline_version))
            })
            .map(|_| ())
    }

    pub fn source(&self) -> SqliteSource {
        SqliteSource::new(&self.database).with_busy_timeout(self.busy_timeout)
    }

    pub fn migrator(&self) -> Result<Migrator, Error> {
        let baseline = self.baseline_version.parse::<Version>().map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid baseline version: {}", self.baseline_version))
                .with_source(err)
        })?;
        Ok(Migrator::bundled()?.with_baseline_version(baseline))
    }
}
