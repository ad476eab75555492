//! Purpose: `phlog` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON document, or JSON Lines for `range`.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All storage access goes through `api::PhLog` and `api::Migrator`.
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use phlog::api::{
    ConnectionSource, EntryKey, Error, ErrorKind, LogEntry, MigrateReport, MigrationInfo,
    MigrationState, PhLog, PhLogConfig, StatusMap, format_rfc3339, parse_rfc3339, status_map,
    to_exit_code,
};
use phlog::notice::{Notice, notice_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `phlog --help` for usage."));
            }
        },
    };

    init_tracing();

    let config = cli.global.config();
    command_dispatch::dispatch_command(cli.command, &config)
        .map_err(add_schema_hint)
        .map_err(add_busy_hint)
}

#[derive(Parser)]
#[command(
    name = "phlog",
    version,
    about = "Holdings change log: record modifications and read them back by time window",
    long_about = None,
    after_help = r#"EXAMPLES
  $ phlog --db phlog.db migrate
  $ phlog --db phlog.db put 870970 12345678 --status-json '{"OnShelf": 2}'
  $ phlog --db phlog.db get 870970 12345678
  $ phlog --db phlog.db range --after 2024-01-01T00:00:00Z --settled

Entries are stamped with the time the log learned about them. `range` reads
[after, before) in pages; use --settled to stop short of writes still in flight."#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct GlobalArgs {
    #[arg(long, env = "PHLOG_DB", help = "SQLite database file", value_hint = clap::ValueHint::FilePath)]
    db: PathBuf,
    #[arg(
        long,
        env = "PHLOG_BUSY_TIMEOUT_MS",
        default_value_t = 5_000,
        help = "How long to wait on a locked database (ms)"
    )]
    busy_timeout_ms: u64,
    #[arg(
        long,
        env = "PHLOG_PAGE_SIZE",
        default_value_t = phlog::api::DEFAULT_PAGE_SIZE,
        help = "Rows fetched per page by range reads"
    )]
    page_size: usize,
    #[arg(
        long,
        env = "PHLOG_BASELINE_VERSION",
        default_value = "1",
        help = "Version recorded when migrating a schema that predates the ledger"
    )]
    baseline_version: String,
    #[arg(
        long,
        env = "PHLOG_SAFETY_MARGIN_MS",
        default_value_t = 5_000,
        help = "Distance from now kept by `range --settled` (ms)"
    )]
    safety_margin_ms: u64,
}

impl GlobalArgs {
    fn config(&self) -> PhLogConfig {
        PhLogConfig::new(&self.db)
            .with_busy_timeout(Duration::from_millis(self.busy_timeout_ms))
            .with_page_size(self.page_size)
            .with_baseline_version(self.baseline_version.clone())
            .with_safety_margin(Duration::from_millis(self.safety_margin_ms))
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Apply pending schema migrations")]
    Migrate,
    #[command(about = "List schema migrations and their state")]
    Info,
    #[command(about = "Record the current state of a holding")]
    Put {
        agency_id: i32,
        bibliographic_record_id: String,
        #[arg(long, help = "Mark the holding as deleted")]
        deleted: bool,
        #[arg(long, help = "Holdings status map as a JSON object of counts")]
        status_json: Option<String>,
    },
    #[command(about = "Show the entry for a holding")]
    Get {
        agency_id: i32,
        bibliographic_record_id: String,
    },
    #[command(about = "Stream entries modified in [after, before) as JSON Lines")]
    Range {
        #[arg(long, help = "Inclusive lower bound (RFC 3339); default: the epoch")]
        after: Option<String>,
        #[arg(
            long,
            conflicts_with = "settled",
            help = "Exclusive upper bound (RFC 3339); default: now"
        )]
        before: Option<String>,
        #[arg(long, help = "Use now minus the safety margin as the upper bound")]
        settled: bool,
        #[arg(long, help = "Stop after this many entries")]
        limit: Option<u64>,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("invalid arguments")
        .trim_start_matches("error: ")
        .to_string()
}

fn add_schema_hint(err: Error) -> Error {
    if err.hint().is_some() || err.kind() != ErrorKind::Storage {
        return err;
    }
    let missing_table = error_causes(&err)
        .iter()
        .any(|cause| cause.contains("no such table"));
    if missing_table {
        err.with_hint("The schema is not migrated yet. Run `phlog --db <file> migrate`.")
    } else {
        err
    }
}

fn add_busy_hint(err: Error) -> Error {
    if err.hint().is_some() || err.kind() != ErrorKind::ResourceExhausted {
        return err;
    }
    err.with_hint("The database is locked or unavailable; retry or raise --busy-timeout-ms.")
}

fn entry_key(agency_id: i32, bibliographic_record_id: String) -> EntryKey {
    EntryKey::new(agency_id, bibliographic_record_id)
}

fn parse_status_json(text: &str) -> Result<StatusMap, Error> {
    status_map::unmarshal(text).map_err(|err| {
        err.with_hint("Pass a JSON object of integer counts, e.g. '{\"OnShelf\": 2}'.")
    })
}

fn entry_json(entry: &LogEntry) -> Result<Value, Error> {
    let time = entry
        .time_of_last_modification()
        .map(format_rfc3339)
        .transpose()?;
    Ok(json!({
        "agency_id": entry.key().agency_id(),
        "bibliographic_record_id": entry.key().bibliographic_record_id(),
        "deleted": entry.deleted(),
        "holdings_status_map": entry.holdings_status_map(),
        "time_of_last_modification": time,
    }))
}

fn migrate_report_json(report: &MigrateReport) -> Value {
    json!({
        "baseline": report.baseline.as_ref().map(ToString::to_string),
        "applied": report.applied.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "current": report.current.as_ref().map(ToString::to_string),
    })
}

fn migration_info_json(info: &MigrationInfo) -> Result<Value, Error> {
    let state = match info.state {
        MigrationState::Pending => "pending",
        MigrationState::Applied => "applied",
        MigrationState::Baseline => "baseline",
        MigrationState::BelowBaseline => "below_baseline",
    };
    let installed_on = info.installed_on.map(format_rfc3339).transpose()?;
    Ok(json!({
        "version": info.version.to_string(),
        "description": info.description,
        "script": info.script,
        "state": state,
        "installed_on": installed_on,
    }))
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn write_json_line(out: &mut impl Write, value: &Value) -> Result<(), Error> {
    serde_json::to_writer(&mut *out, value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to write output")
            .with_source(err)
    })?;
    out.write_all(b"\n").map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to write output")
            .with_source(err)
    })
}

fn emit_notice(notice: &Notice) {
    if io::stderr().is_terminal() {
        eprintln!("notice: {} (database: {})", notice.message, notice.database);
        return;
    }
    let json = serde_json::to_string(&notice_json(notice)).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn notice_time_now() -> String {
    format_rfc3339(time::OffsetDateTime::now_utc()).unwrap_or_default()
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    err.message()
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("{:?}", err.kind()))
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        causes.push(source.to_string());
        current = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    if let Some(version) = err.version() {
        inner.insert("version".to_string(), json!(version));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(key) = err.key() {
        lines.push(format!("key: {key}"));
    }
    if let Some(version) = err.version() {
        lines.push(format!("version: {version}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}
