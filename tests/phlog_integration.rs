// Repository integration tests: write stamping, range reads, cursor lifetime.
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use phlog::api::{
    EntryKey, ErrorKind, LogEntry, ManualClock, PhLog, PhLogConfig, StatusMap,
};
use proptest::prelude::*;
use rusqlite::Connection;
use time::OffsetDateTime;

const AGENCY: i32 = 123456;

fn epoch_plus(seconds: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_600_000_000 + seconds).expect("ts")
}

fn open(path: &Path, clock: Arc<ManualClock>) -> PhLog {
    let config = PhLogConfig::new(path);
    let (phlog, _report) = PhLog::open_migrated(&config).expect("open migrated");
    phlog.with_clock(clock)
}

/// testId1..testId4, one second apart.
fn populate(phlog: &mut PhLog, clock: &ManualClock) {
    for i in 1..=4 {
        clock.set(epoch_plus(i));
        let mut map = StatusMap::new();
        map.insert("OnShelf".to_string(), i as i32);
        phlog
            .upsert(
                &LogEntry::new(EntryKey::new(AGENCY, format!("testId{i}")))
                    .with_holdings_status_map(map),
            )
            .expect("populate");
    }
}

fn ids(phlog: &PhLog, after: OffsetDateTime, before: OffsetDateTime) -> BTreeSet<String> {
    phlog
        .entries_modified_between(after, before)
        .expect("open range")
        .map(|entry| {
            entry
                .expect("entry")
                .key()
                .bibliographic_record_id()
                .to_string()
        })
        .collect()
}

#[test]
fn time_of_last_modification_changes_when_entry_is_updated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(epoch_plus(0)));
    let mut phlog = open(&dir.path().join("phlog.db"), clock.clone());
    populate(&mut phlog, &clock);

    let key = EntryKey::new(AGENCY, "testId1");
    let before = phlog.get(&key).expect("entry");
    assert!(!before.deleted());

    clock.advance(Duration::from_secs(30));
    let current = phlog.get(&key).expect("entry");
    phlog.upsert(&current.with_deleted(true)).expect("update");

    let after = phlog.get(&key).expect("entry");
    assert!(after.deleted());
    assert_eq!(after.holdings_status_map(), before.holdings_status_map());
    assert_eq!(after.time_of_last_modification(), Some(epoch_plus(34)));
    assert!(after.time_of_last_modification() > before.time_of_last_modification());
}

#[test]
fn entries_modified_between_is_half_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(epoch_plus(0)));
    let mut phlog = open(&dir.path().join("phlog.db"), clock.clone());
    populate(&mut phlog, &clock);

    let t2 = phlog
        .get(&EntryKey::new(AGENCY, "testId2"))
        .expect("entry2")
        .time_of_last_modification()
        .expect("t2");
    let t4 = phlog
        .get(&EntryKey::new(AGENCY, "testId4"))
        .expect("entry4")
        .time_of_last_modification()
        .expect("t4");

    let expected = ["testId2", "testId3"]
        .iter()
        .map(ToString::to_string)
        .collect::<BTreeSet<_>>();
    assert_eq!(ids(&phlog, t2, t4), expected);
    assert!(ids(&phlog, t2, t2).is_empty());
}

#[test]
fn range_rows_are_detached_and_time_ordered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(epoch_plus(0)));
    let mut phlog = open(&dir.path().join("phlog.db"), clock.clone());
    populate(&mut phlog, &clock);

    let entries = phlog
        .entries_modified_between(epoch_plus(0), epoch_plus(10))
        .expect("range")
        .collect::<Result<Vec<_>, _>>()
        .expect("entries");
    let times = entries
        .iter()
        .map(|entry| entry.time_of_last_modification().expect("time"))
        .collect::<Vec<_>>();
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);
    assert_eq!(entries[2].holdings_status_map().and_then(|m| m.get("OnShelf")), Some(&3));

    // Mutating a yielded copy does not touch storage.
    let changed = entries[0].clone().with_deleted(true);
    assert!(changed.deleted());
    assert!(!phlog.get(changed.key()).expect("stored").deleted());
}

#[test]
fn iterating_many_rows_keeps_one_page_buffered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(epoch_plus(0)));
    let mut phlog = open(&dir.path().join("phlog.db"), clock.clone());

    let entries = (0..10_000)
        .map(|i| LogEntry::new(EntryKey::new(AGENCY, format!("rec{i:05}"))))
        .collect::<Vec<_>>();
    phlog.upsert_all(&entries).expect("bulk load");
    drop(entries);

    let phlog = phlog.with_page_size(50);
    let mut results = phlog
        .entries_modified_between(epoch_plus(0), epoch_plus(1))
        .expect("range");
    let mut count = 0;
    let mut previous: Option<String> = None;
    while let Some(entry) = results.next_entry().expect("next") {
        assert!(results.buffered() < 50, "buffer grew to {}", results.buffered());
        let id = entry.key().bibliographic_record_id().to_string();
        if let Some(previous) = &previous {
            assert!(previous < &id, "duplicate or out-of-order row {id}");
        }
        previous = Some(id);
        count += 1;
    }
    assert_eq!(count, 10_000);
    assert_eq!(results.peak_buffered(), 50);
    assert_eq!(results.position(), 10_000);
    assert!(results.is_closed());
}

#[test]
fn partial_iterations_release_the_cursor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(epoch_plus(0)));
    let mut phlog = open(&dir.path().join("phlog.db"), clock.clone());
    populate(&mut phlog, &clock);

    for _ in 0..500 {
        let mut results = phlog
            .entries_modified_between(epoch_plus(0), epoch_plus(10))
            .expect("range");
        assert!(results.next_entry().expect("first").is_some());
        results.close().expect("close");
    }
    for _ in 0..500 {
        for entry in phlog
            .entries_modified_between(epoch_plus(0), epoch_plus(10))
            .expect("range")
        {
            entry.expect("entry");
            break;
        }
    }

    assert!(phlog.connection().is_autocommit());
    let count: i64 = phlog
        .connection()
        .query_row("SELECT COUNT(*) FROM entry", [], |row| row.get(0))
        .expect("unrelated query");
    assert_eq!(count, 4);

    clock.advance(Duration::from_secs(60));
    phlog
        .upsert(&LogEntry::new(EntryKey::new(AGENCY, "testId5")))
        .expect("write after reads");
}

#[test]
fn leaked_cursor_blocks_the_connection_until_closed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(epoch_plus(0)));
    let mut phlog = open(&dir.path().join("phlog.db"), clock.clone());
    populate(&mut phlog, &clock);

    let first = phlog
        .entries_modified_between(epoch_plus(0), epoch_plus(10))
        .expect("range");
    let err = phlog
        .entries_modified_between(epoch_plus(0), epoch_plus(10))
        .expect_err("second cursor");
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    drop(first);
    phlog
        .entries_modified_between(epoch_plus(0), epoch_plus(10))
        .expect("after drop");
}

#[test]
fn open_cursor_reads_from_its_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("phlog.db");
    let clock = Arc::new(ManualClock::new(epoch_plus(0)));
    let mut phlog = open(&path, clock.clone());
    let entries = (0..9)
        .map(|i| LogEntry::new(EntryKey::new(AGENCY, format!("rec{i}"))))
        .collect::<Vec<_>>();
    phlog.upsert_all(&entries).expect("load");

    let writer_clock = Arc::new(ManualClock::new(epoch_plus(5)));
    let mut writer = open(&path, writer_clock);

    let reader = phlog.with_page_size(3);
    let mut results = reader
        .entries_modified_between(epoch_plus(0), epoch_plus(10))
        .expect("range");
    assert!(results.next_entry().expect("first").is_some());

    writer
        .upsert(&LogEntry::new(EntryKey::new(AGENCY, "late")))
        .expect("concurrent write");

    let mut seen = 1;
    while let Some(entry) = results.next_entry().expect("next") {
        assert_ne!(entry.key().bibliographic_record_id(), "late");
        seen += 1;
    }
    assert_eq!(seen, 9);
    drop(results);

    assert!(ids(&reader, epoch_plus(0), epoch_plus(10)).contains("late"));
}

#[test]
fn concurrent_writers_on_distinct_keys_all_land() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("phlog.db");
    let config = PhLogConfig::new(&path);
    PhLog::open_migrated(&config).expect("migrate");

    let handles = (0..4)
        .map(|worker| {
            let config = config.clone();
            std::thread::spawn(move || {
                let mut phlog = PhLog::open(&config).expect("open");
                for i in 0..50 {
                    phlog
                        .upsert(&LogEntry::new(EntryKey::new(worker, format!("rec{i}"))))
                        .expect("upsert");
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().expect("writer");
    }

    let conn = Connection::open(&path).expect("open");
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM entry", [], |row| row.get(0))
        .expect("count");
    assert_eq!(count, 200);
}

#[test]
fn system_clock_writes_never_go_backwards() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = PhLogConfig::new(dir.path().join("phlog.db"));
    let (mut phlog, _) = PhLog::open_migrated(&config).expect("open");
    let entry = LogEntry::new(EntryKey::new(AGENCY, "hot"));

    let mut previous = None;
    for _ in 0..200 {
        let stored = phlog.upsert(&entry).expect("upsert");
        let time = stored.time_of_last_modification().expect("stamped");
        if let Some(previous) = previous {
            assert!(time > previous);
        }
        previous = Some(time);
    }
}

fn scatter(times: &[u8]) -> PhLog {
    let mut conn = Connection::open_in_memory().expect("open");
    phlog::api::Migrator::bundled()
        .expect("bundled")
        .migrate_connection(&mut conn)
        .expect("migrate");
    let clock = Arc::new(ManualClock::new(epoch_plus(0)));
    let mut phlog = PhLog::new(conn).with_clock(clock.clone()).with_page_size(4);
    for (i, offset) in times.iter().enumerate() {
        clock.set(epoch_plus(i64::from(*offset)));
        phlog
            .upsert(&LogEntry::new(EntryKey::new(AGENCY, format!("rec{i}"))))
            .expect("upsert");
    }
    phlog
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn adjacent_windows_compose(
        times in prop::collection::vec(0u8..100, 0..40),
        a in 0i64..50,
        gap1 in 0i64..30,
        gap2 in 0i64..30,
    ) {
        let phlog = scatter(&times);
        let (a, b, c) = (epoch_plus(a), epoch_plus(a + gap1), epoch_plus(a + gap1 + gap2));

        let whole = ids(&phlog, a, c);
        let left = ids(&phlog, a, b);
        let right = ids(&phlog, b, c);

        prop_assert!(left.is_disjoint(&right));
        let union = left.union(&right).cloned().collect::<BTreeSet<_>>();
        prop_assert_eq!(whole, union);
    }
}
