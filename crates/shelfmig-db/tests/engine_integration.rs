use std::path::Path;

use rusqlite::Connection;
use shelfmig_common::Error;
use shelfmig_db::{
    DirectorySource, MigrationUnit, Migrator, MigratorOptions, RunState, SkipReason, UnitStatus,
    bookshelf,
};

fn unit(version: u64, name: &str, forward: &str, reverse: Option<&str>) -> MigrationUnit {
    MigrationUnit::new(version, name, forward, reverse.map(str::to_string)).unwrap()
}

fn open(path: &Path, units: Vec<MigrationUnit>) -> Migrator {
    Migrator::open(path, Box::new(units), MigratorOptions::default()).unwrap()
}

fn table_names(path: &Path) -> Vec<String> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE '\\_shelfmig%' ESCAPE '\\'
             AND name NOT LIKE 'sqlite%' ORDER BY name",
        )
        .unwrap();
    stmt.query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<String>, _>>()
        .unwrap()
}

fn ledger_versions(m: &Migrator) -> Vec<u64> {
    m.with_connection(|conn| m.ledger().list_applied(conn))
        .unwrap()
        .into_iter()
        .map(|r| r.version)
        .collect()
}

fn bookshelf_units() -> Vec<MigrationUnit> {
    use shelfmig_db::MigrationSource;
    bookshelf::source().list_all().unwrap()
}

#[test]
fn fresh_database_applies_bookshelf_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shelf.db");
    let m = Migrator::open(&db, Box::new(bookshelf::source()), MigratorOptions::default())
        .unwrap();

    let report = m.up(None).unwrap().into_result().unwrap();
    assert_eq!(report.applied(), vec![1, 2, 3]);
    assert!(matches!(report.state, RunState::Committed));
    assert_eq!(ledger_versions(&m), vec![1, 2, 3]);
    assert_eq!(table_names(&db), vec!["books", "roles", "users"]);
}

#[test]
fn second_run_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shelf.db");
    let m = open(&db, bookshelf_units());

    m.up(None).unwrap();
    let before = m
        .with_connection(|conn| m.ledger().list_applied(conn))
        .unwrap();

    let report = m.up(None).unwrap();
    assert!(report.is_noop());
    assert!(report.outcomes.iter().all(|o| o.status
        == UnitStatus::Skipped {
            reason: SkipReason::AlreadyApplied
        }));
    let after = m
        .with_connection(|conn| m.ledger().list_applied(conn))
        .unwrap();
    assert_eq!(before, after);
}

#[test]
fn only_the_new_unit_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shelf.db");
    let all = bookshelf_units();

    let m = open(&db, all[..2].to_vec());
    assert_eq!(m.up(None).unwrap().applied(), vec![1, 2]);
    drop(m);

    let m = open(&db, all);
    assert_eq!(m.up(None).unwrap().applied(), vec![3]);
    assert_eq!(ledger_versions(&m), vec![1, 2, 3]);
}

#[test]
fn failed_unit_leaves_no_trace_and_halts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shelf.db");
    let units = vec![
        unit(1, "first", "CREATE TABLE first (id INTEGER);", None),
        unit(
            2,
            "half_broken",
            "CREATE TABLE partial (id INTEGER); INSERT INTO missing_table VALUES (1);",
            None,
        ),
        unit(3, "third", "CREATE TABLE third (id INTEGER);", None),
    ];
    let m = open(&db, units);

    let report = m.up(None).unwrap();
    assert_eq!(report.applied(), vec![1]);
    assert_eq!(report.failed().map(|o| o.version), Some(2));
    assert_eq!(
        report.outcomes[2].status,
        UnitStatus::Skipped {
            reason: SkipReason::NotReached
        }
    );
    match &report.state {
        RunState::Halted { at, cause } => {
            assert_eq!(*at, 2);
            assert!(matches!(cause, Error::Application { version: 2, .. }));
        }
        other => panic!("expected halted run, got {other:?}"),
    }

    assert_eq!(ledger_versions(&m), vec![1]);
    assert_eq!(table_names(&db), vec!["first"]);

    let err = report.into_result().unwrap_err();
    assert_eq!(err.exit_status().code(), 3);
}

#[test]
fn reversed_source_is_reordered_before_applying() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shelf.db");
    // Each unit depends on the previous one's table.
    let units = vec![
        unit(3, "c", "CREATE VIEW c AS SELECT * FROM b;", None),
        unit(2, "b", "CREATE TABLE b AS SELECT * FROM a;", None),
        unit(1, "a", "CREATE TABLE a (id INTEGER);", None),
    ];
    let m = open(&db, units);

    assert_eq!(m.up(None).unwrap().applied(), vec![1, 2, 3]);
}

#[test]
fn edited_applied_migration_is_drift() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    std::fs::create_dir(&migrations).unwrap();
    std::fs::write(
        migrations.join("0001_roles.up.sql"),
        "CREATE TABLE roles (id INTEGER);",
    )
    .unwrap();
    let db = dir.path().join("shelf.db");

    let m = Migrator::open(
        &db,
        Box::new(DirectorySource::new(&migrations)),
        MigratorOptions::default(),
    )
    .unwrap();
    m.up(None).unwrap();

    std::fs::write(
        migrations.join("0001_roles.up.sql"),
        "CREATE TABLE roles (id INTEGER, name TEXT);",
    )
    .unwrap();
    std::fs::write(
        migrations.join("0002_users.up.sql"),
        "CREATE TABLE users (id INTEGER);",
    )
    .unwrap();

    let err = m.up(None).unwrap_err();
    assert!(matches!(err, Error::Drift { version: 1, .. }));
    assert_eq!(err.exit_status().code(), 2);
    assert_eq!(ledger_versions(&m), vec![1]);
    assert_eq!(table_names(&db), vec!["roles"]);
    // The failed validation released the lock.
    assert!(!m.force_unlock().unwrap());
}

#[test]
fn validation_errors_release_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shelf.db");
    let all = bookshelf_units();

    let m = open(&db, vec![all[0].clone(), all[2].clone()]);
    assert_eq!(m.up(None).unwrap().applied(), vec![1, 3]);
    drop(m);

    // Version 2 appears below the newest applied version.
    let m = open(&db, all.clone());
    assert!(matches!(
        m.up(None),
        Err(Error::OutOfOrder {
            version: 2,
            latest_applied: 3
        })
    ));
    assert!(!m.force_unlock().unwrap());
    drop(m);

    // Version 3 is applied but gone from the source.
    let m = open(&db, all[..2].to_vec());
    let err = m.up(None).unwrap_err();
    assert!(matches!(err, Error::MissingMigration { version: 3, .. }));
    assert_eq!(err.exit_status().code(), 2);
    assert!(!m.force_unlock().unwrap());
    assert_eq!(ledger_versions(&m), vec![1, 3]);
}

#[test]
fn down_one_reverts_the_newest_unit() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shelf.db");
    let m = open(&db, bookshelf_units());
    m.up(None).unwrap();

    let report = m.rollback(1).unwrap();
    assert_eq!(report.reverted, vec![3]);
    assert_eq!(ledger_versions(&m), vec![1, 2]);
    assert_eq!(table_names(&db), vec!["roles", "users"]);

    // Applying again picks the reverted unit back up.
    assert_eq!(m.up(None).unwrap().applied(), vec![3]);
}

#[test]
fn down_on_irreversible_unit_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shelf.db");
    let mut units = bookshelf_units();
    let books = units.pop().unwrap();
    units.push(unit(3, books.name(), books.forward(), None));
    let m = open(&db, units);
    m.up(None).unwrap();

    let report = m.rollback(1).unwrap();
    assert!(report.reverted.is_empty());
    let err = report.into_result().unwrap_err();
    assert!(matches!(err, Error::Irreversible { version: 3, .. }));
    assert_eq!(err.exit_status().code(), 2);
    assert_eq!(ledger_versions(&m), vec![1, 2, 3]);
    assert_eq!(table_names(&db), vec!["books", "roles", "users"]);
}

#[test]
fn concurrent_runner_sees_lock_contention() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shelf.db");
    let first = open(&db, bookshelf_units());
    let second = open(&db, bookshelf_units());

    // Hold the lock row the way a live run would.
    first
        .with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS _shelfmig_migrations_lock (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    holder TEXT NOT NULL,
                    acquired_at TEXT NOT NULL
                 );
                 INSERT INTO _shelfmig_migrations_lock VALUES (1, 'other-run', 'now');",
            )
            .map_err(|e| Error::Database(e.to_string()))
        })
        .unwrap();

    let err = second.up(None).unwrap_err();
    assert!(matches!(err, Error::LockContention(ref who) if who.contains("other-run")));
    assert_eq!(err.exit_status().code(), 4);
    assert!(second.rollback(1).is_err());

    assert!(second.force_unlock().unwrap());
    assert_eq!(second.up(None).unwrap().applied(), vec![1, 2, 3]);
}
