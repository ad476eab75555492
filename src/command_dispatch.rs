//! Purpose: Hold top-level CLI command dispatch for `phlog`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: `range` output goes through the bounded cursor, one JSON line per entry.
//! Invariants: The cursor is closed before the completion notice is emitted.

use super::*;

pub(super) fn dispatch_command(command: Command, config: &PhLogConfig) -> Result<RunOutcome, Error> {
    config.validate()?;
    match command {
        Command::Migrate => {
            let report = config.migrator()?.migrate(&config.source())?;
            emit_json(migrate_report_json(&report));
            Ok(RunOutcome::ok())
        }
        Command::Info => {
            let conn = config.source().connect()?;
            let infos = config.migrator()?.info(&conn)?;
            let values = infos
                .iter()
                .map(migration_info_json)
                .collect::<Result<Vec<_>, _>>()?;
            emit_json(json!({ "migrations": values }));
            Ok(RunOutcome::ok())
        }
        Command::Put {
            agency_id,
            bibliographic_record_id,
            deleted,
            status_json,
        } => {
            let mut entry =
                LogEntry::new(entry_key(agency_id, bibliographic_record_id)).with_deleted(deleted);
            if let Some(text) = status_json {
                entry = entry.with_holdings_status_map(parse_status_json(&text)?);
            }
            let mut phlog = PhLog::open(config)?;
            let stored = phlog.upsert(&entry)?;
            emit_json(entry_json(&stored)?);
            Ok(RunOutcome::ok())
        }
        Command::Get {
            agency_id,
            bibliographic_record_id,
        } => {
            let phlog = PhLog::open(config)?;
            let entry = phlog.get(&entry_key(agency_id, bibliographic_record_id))?;
            emit_json(entry_json(&entry)?);
            Ok(RunOutcome::ok())
        }
        Command::Range {
            after,
            before,
            settled,
            limit,
        } => {
            let phlog = PhLog::open(config)?;
            let after = match after {
                Some(text) => parse_rfc3339(&text)?,
                None => time::OffsetDateTime::UNIX_EPOCH,
            };
            let before = match (before, settled) {
                (Some(text), _) => parse_rfc3339(&text)?,
                (None, true) => phlog.settled_before(),
                (None, false) => time::OffsetDateTime::now_utc(),
            };
            if before < after {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("--before is earlier than --after")
                    .with_hint("The window is [after, before); pass a later --before."));
            }
            let count = stream_range(&phlog, after, before, limit)?;

            let notice = Notice::new(
                "range_complete",
                "range",
                config.database().display().to_string(),
                notice_time_now(),
            )
            .with_message(format!("read {count} entries"))
            .with_detail("after", format_rfc3339(after)?)
            .with_detail("before", format_rfc3339(before)?)
            .with_detail("count", count)
            .with_detail("limited", limit == Some(count));
            emit_notice(&notice);
            Ok(RunOutcome::ok())
        }
    }
}

fn stream_range(
    phlog: &PhLog,
    after: time::OffsetDateTime,
    before: time::OffsetDateTime,
    limit: Option<u64>,
) -> Result<u64, Error> {
    let mut results = phlog.entries_modified_between(after, before)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut count = 0u64;

    while limit.is_none_or(|limit| count < limit) {
        let Some(entry) = results.next_entry()? else {
            break;
        };
        write_json_line(&mut out, &entry_json(&entry)?)?;
        count += 1;
    }
    out.flush().map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to write output")
            .with_source(err)
    })?;
    results.close()?;
    Ok(count)
}
