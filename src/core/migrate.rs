// Versioned schema migrations recorded in the `schema_version` ledger.
//
// Every step runs under `BEGIN IMMEDIATE`, which takes the database write lock
// before the ledger is read, so concurrent runners serialize on the database
// itself and each re-reads the ledger after acquiring the lock.
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::core::error::{Error, ErrorKind};
use crate::core::source::{ConnectionSource, sql_error};
use crate::core::timestamp;

pub const LEDGER_TABLE: &str = "schema_version";
pub const DEFAULT_BASELINE_VERSION: &str = "1";

const BASELINE_TYPE: &str = "BASELINE";
const SQL_TYPE: &str = "SQL";
const BASELINE_LABEL: &str = "<< Baseline >>";

const BUNDLED: &[(&str, &str)] = &[
    (
        "V1__create_entry_table.sql",
        include_str!("../../migrations/V1__create_entry_table.sql"),
    ),
    (
        "V2__entry_time_of_last_modification_index.sql",
        include_str!("../../migrations/V2__entry_time_of_last_modification_index.sql"),
    ),
];

const CREATE_LEDGER: &str = "CREATE TABLE schema_version (
    installed_rank INTEGER PRIMARY KEY,
    version        TEXT    NOT NULL UNIQUE,
    description    TEXT    NOT NULL,
    type           TEXT    NOT NULL,
    script         TEXT    NOT NULL,
    checksum       TEXT,
    installed_on   INTEGER NOT NULL,
    execution_time INTEGER NOT NULL,
    success        INTEGER NOT NULL
)";

/// Dotted numeric migration version such as `1`, `2` or `1.1`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Version(Vec<u32>);

impl Version {
    pub fn parts(&self) -> &[u32] {
        &self.0
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        let parts = text
            .split(['.', '_'])
            .map(|part| part.parse::<u32>().ok())
            .collect::<Option<Vec<_>>>()
            .filter(|parts| !parts.is_empty())
            .ok_or_else(|| {
                Error::new(ErrorKind::Migration)
                    .with_message(format!("invalid migration version: {text:?}"))
            })?;
        Ok(Self(parts))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{part}")?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Migration {
    version: Version,
    description: String,
    script: String,
    sql: String,
    checksum: String,
}

impl Migration {
    /// Builds a migration from a `V<version>__<description>.sql` script name.
    pub fn from_script(script: &str, sql: impl Into<String>) -> Result<Self, Error> {
        let invalid = || {
            Error::new(ErrorKind::Migration)
                .with_message(format!("invalid migration script name: {script:?}"))
                .with_hint("Name scripts V<version>__<description>.sql, e.g. V3__add_column.sql.")
        };
        let stem = script.strip_suffix(".sql").ok_or_else(invalid)?;
        let rest = stem.strip_prefix('V').ok_or_else(invalid)?;
        let (version, description) = rest.split_once("__").ok_or_else(invalid)?;
        let version = version.parse::<Version>().map_err(|_| invalid())?;
        let sql = sql.into();
        Ok(Self {
            version,
            description: description.replace('_', " "),
            script: script.to_string(),
            checksum: checksum(&sql),
            sql,
        })
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

fn checksum(sql: &str) -> String {
    format!("{:x}", Sha256::digest(sql.as_bytes()))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MigrationState {
    Pending,
    Applied,
    Baseline,
    BelowBaseline,
}

#[derive(Clone, Debug)]
pub struct MigrationInfo {
    pub version: Version,
    pub description: String,
    pub script: String,
    pub state: MigrationState,
    pub installed_on: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MigrateReport {
    /// Baseline recorded by this run, if the ledger was created over an existing schema.
    pub baseline: Option<Version>,
    /// Versions applied by this run, in order.
    pub applied: Vec<Version>,
    /// Highest version recorded in the ledger after the run.
    pub current: Option<Version>,
}

#[derive(Debug)]
struct LedgerRow {
    rank: i64,
    version: Version,
    description: String,
    kind: String,
    script: String,
    checksum: Option<String>,
    installed_on: i64,
    success: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    rows: Vec<LedgerRow>,
}

impl Ledger {
    fn read(conn: &Connection) -> Result<Self, Error> {
        if !table_exists(conn, LEDGER_TABLE)? {
            return Ok(Self::default());
        }
        let mut stmt = conn
            .prepare(
                "SELECT installed_rank, version, description, type, script, checksum,
                        installed_on, success
                 FROM schema_version ORDER BY installed_rank",
            )
            .map_err(|err| sql_error(err, "failed to read migration ledger"))?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, bool>(7)?,
                ))
            })
            .map_err(|err| sql_error(err, "failed to read migration ledger"))?;

        let mut rows = Vec::new();
        for item in raw {
            let (rank, version, description, kind, script, checksum, installed_on, success) =
                item.map_err(|err| sql_error(err, "failed to read migration ledger"))?;
            rows.push(LedgerRow {
                rank,
                version: version.parse()?,
                description,
                kind,
                script,
                checksum,
                installed_on,
                success,
            });
        }
        Ok(Self { rows })
    }

    fn baseline(&self) -> Option<&Version> {
        self.rows
            .iter()
            .filter(|row| row.kind == BASELINE_TYPE)
            .map(|row| &row.version)
            .max()
    }

    fn applied(&self, version: &Version) -> Option<&LedgerRow> {
        self.rows
            .iter()
            .find(|row| row.kind == SQL_TYPE && &row.version == version)
    }

    fn current(&self) -> Option<Version> {
        self.rows
            .iter()
            .filter(|row| row.success)
            .map(|row| row.version.clone())
            .max()
    }

    fn next_rank(&self) -> i64 {
        self.rows.iter().map(|row| row.rank).max().unwrap_or(0) + 1
    }
}

#[derive(Clone, Debug)]
pub struct Migrator {
    migrations: Vec<Migration>,
    baseline_version: Version,
}

impl Migrator {
    /// Migrator over the scripts compiled into this crate.
    pub fn bundled() -> Result<Self, Error> {
        let migrations = BUNDLED
            .iter()
            .map(|(script, sql)| Migration::from_script(script, *sql))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(migrations)
    }

    pub fn new(mut migrations: Vec<Migration>) -> Result<Self, Error> {
        migrations.sort_by(|a, b| a.version.cmp(&b.version));
        if let Some(pair) = migrations.windows(2).find(|pair| pair[0].version == pair[1].version) {
            return Err(Error::new(ErrorKind::Migration)
                .with_message(format!(
                    "duplicate migration version in {} and {}",
                    pair[0].script, pair[1].script
                ))
                .with_version(&pair[0].version));
        }
        Ok(Self {
            migrations,
            baseline_version: DEFAULT_BASELINE_VERSION.parse()?,
        })
    }

    pub fn with_baseline_version(mut self, baseline_version: Version) -> Self {
        self.baseline_version = baseline_version;
        self
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn latest_version(&self) -> Option<&Version> {
        self.migrations.last().map(|migration| &migration.version)
    }

    /// Lists every known migration with its state in the given database.
    pub fn info(&self, conn: &Connection) -> Result<Vec<MigrationInfo>, Error> {
        let ledger = Ledger::read(conn)?;
        let baseline = ledger.baseline().cloned();
        let mut infos = Vec::new();

        for row in ledger.rows.iter().filter(|row| row.kind == BASELINE_TYPE) {
            infos.push(MigrationInfo {
                version: row.version.clone(),
                description: row.description.clone(),
                script: row.script.clone(),
                state: MigrationState::Baseline,
                installed_on: timestamp::from_micros(row.installed_on).ok(),
            });
        }

        for migration in &self.migrations {
            let (state, installed_on) = match ledger.applied(&migration.version) {
                Some(row) => (
                    MigrationState::Applied,
                    timestamp::from_micros(row.installed_on).ok(),
                ),
                None if baseline.as_ref().is_some_and(|b| &migration.version <= b) => {
                    (MigrationState::BelowBaseline, None)
                }
                None => (MigrationState::Pending, None),
            };
            infos.push(MigrationInfo {
                version: migration.version.clone(),
                description: migration.description.clone(),
                script: migration.script.clone(),
                state,
                installed_on,
            });
        }

        infos.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(infos)
    }

    /// Brings the database behind `source` up to the latest bundled version.
    pub fn migrate(&self, source: &dyn ConnectionSource) -> Result<MigrateReport, Error> {
        let mut conn = source.connect()?;
        self.migrate_connection(&mut conn)
            .map_err(|err| err.with_path(source.describe()))
    }

    pub fn migrate_connection(&self, conn: &mut Connection) -> Result<MigrateReport, Error> {
        let mut report = MigrateReport {
            baseline: self.prepare_ledger(conn)?,
            ..MigrateReport::default()
        };

        for info in self.info(conn)? {
            tracing::info!(
                version = %info.version,
                description = %info.description,
                script = %info.script,
                state = ?info.state,
                "database migration"
            );
        }

        loop {
            let tx = immediate(conn)?;
            let ledger = Ledger::read(&tx)?;
            self.validate(&ledger)?;

            let Some(migration) = self.next_pending(&ledger) else {
                report.current = ledger.current();
                break;
            };
            apply(&tx, migration, ledger.next_rank())?;
            tx.commit().map_err(|err| {
                sql_error(err, "failed to commit migration").with_version(&migration.version)
            })?;
            report.applied.push(migration.version.clone());
        }

        tracing::info!(
            applied = report.applied.len(),
            current = %report.current.as_ref().map(ToString::to_string).unwrap_or_default(),
            "database migration finished"
        );
        Ok(report)
    }

    fn prepare_ledger(&self, conn: &mut Connection) -> Result<Option<Version>, Error> {
        let tx = immediate(conn)?;
        if table_exists(&tx, LEDGER_TABLE)? {
            return Ok(None);
        }

        let existing_tables: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .map_err(|err| sql_error(err, "failed to inspect schema"))?;

        tx.execute_batch(CREATE_LEDGER)
            .map_err(|err| sql_error(err, "failed to create migration ledger"))?;

        let baseline = if existing_tables > 0 {
            tx.execute(
                "INSERT INTO schema_version
                    (installed_rank, version, description, type, script, checksum,
                     installed_on, execution_time, success)
                 VALUES (1, ?1, ?2, ?3, ?2, NULL, ?4, 0, 1)",
                params![
                    self.baseline_version.to_string(),
                    BASELINE_LABEL,
                    BASELINE_TYPE,
                    now_micros()?
                ],
            )
            .map_err(|err| sql_error(err, "failed to record baseline"))?;
            tracing::info!(
                version = %self.baseline_version,
                "existing schema without ledger, recorded baseline"
            );
            Some(self.baseline_version.clone())
        } else {
            None
        };

        tx.commit()
            .map_err(|err| sql_error(err, "failed to create migration ledger"))?;
        Ok(baseline)
    }

    fn validate(&self, ledger: &Ledger) -> Result<(), Error> {
        for row in ledger.rows.iter().filter(|row| row.kind == SQL_TYPE) {
            if !row.success {
                return Err(Error::new(ErrorKind::Migration)
                    .with_message(format!("ledger records failed migration {}", row.script))
                    .with_version(&row.version)
                    .with_hint("Repair the schema by hand and remove the failed ledger row."));
            }
            let Some(migration) = self.migrations.iter().find(|m| m.version == row.version)
            else {
                return Err(Error::new(ErrorKind::Migration)
                    .with_message(format!("applied migration {} is not known", row.script))
                    .with_version(&row.version)
                    .with_hint("The database was migrated by a newer release."));
            };
            if row.checksum.as_deref() != Some(migration.checksum()) {
                return Err(Error::new(ErrorKind::Migration)
                    .with_message(format!(
                        "checksum mismatch for {}: ledger has {}, script has {}",
                        migration.script,
                        row.checksum.as_deref().unwrap_or("none"),
                        migration.checksum
                    ))
                    .with_version(&row.version)
                    .with_hint("Applied scripts must not be edited; add a new version instead."));
            }
        }
        Ok(())
    }

    fn next_pending(&self, ledger: &Ledger) -> Option<&Migration> {
        let baseline = ledger.baseline();
        self.migrations.iter().find(|migration| {
            ledger.applied(&migration.version).is_none()
                && !baseline.is_some_and(|b| &migration.version <= b)
        })
    }
}

fn apply(tx: &Transaction<'_>, migration: &Migration, rank: i64) -> Result<(), Error> {
    tracing::info!(
        version = %migration.version,
        script = %migration.script,
        "applying database migration"
    );
    let started = Instant::now();
    tx.execute_batch(&migration.sql).map_err(|err| {
        Error::new(ErrorKind::Migration)
            .with_message(format!("migration {} failed", migration.script))
            .with_version(&migration.version)
            .with_source(err)
    })?;
    let execution_time = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

    tx.execute(
        "INSERT INTO schema_version
            (installed_rank, version, description, type, script, checksum,
             installed_on, execution_time, success)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)",
        params![
            rank,
            migration.version.to_string(),
            migration.description,
            SQL_TYPE,
            migration.script,
            migration.checksum,
            now_micros()?,
            execution_time
        ],
    )
    .map_err(|err| {
        Error::new(ErrorKind::Migration)
            .with_message(format!("failed to record migration {}", migration.script))
            .with_version(&migration.version)
            .with_source(err)
    })?;
    Ok(())
}

fn immediate(conn: &mut Connection) -> Result<Transaction<'_>, Error> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|err| sql_error(err, "failed to acquire migration lock"))
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, Error> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|err| sql_error(err, "failed to inspect schema"))
}

fn now_micros() -> Result<i64, Error> {
    timestamp::to_micros(OffsetDateTime::now_utc())
}
