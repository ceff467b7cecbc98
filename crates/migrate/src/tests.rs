//! Engine tests against an in-memory backend
//!
//! `MemoryBackend` keeps tracker tables, the script execution log and the
//! advisory lock in shared state, so several sessions can observe one
//! "database".

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing_test::traced_test;

use crate::backends::{BackendError, BackendResult, MigrationBackend};
use crate::config::MigrationConfig;
use crate::definitions::{AppliedRecord, MigrationDirection, RollbackCount};
use crate::engine::Migrator;
use crate::error::MigrationError;
use crate::repository::ScriptRepository;

#[derive(Debug, Default)]
struct TrackerTable {
    rows: Vec<AppliedRecord>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, TrackerTable>,
    executed: Vec<String>,
    fail_on: Vec<String>,
    lock_holder: Option<(i64, usize)>,
    next_session: usize,
    closed_sessions: usize,
}

/// In-memory stand-in for a database session
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    session: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            session: 0,
        }
    }

    /// Another session against the same in-memory database
    pub fn session(&self) -> Self {
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        Self {
            state: Arc::clone(&self.state),
            session: state.next_session,
        }
    }

    /// Make any script containing `fragment` fail
    pub fn fail_on(&self, fragment: &str) {
        self.state.lock().unwrap().fail_on.push(fragment.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_on.clear();
    }

    /// Scripts executed so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn records(&self, table: &str) -> Vec<AppliedRecord> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state.lock().unwrap().tables.contains_key(table)
    }

    pub fn lock_held(&self) -> bool {
        self.state.lock().unwrap().lock_holder.is_some()
    }

    pub fn closed_sessions(&self) -> usize {
        self.state.lock().unwrap().closed_sessions
    }
}

fn missing_table(table: &str) -> BackendError {
    BackendError::new(format!("relation \"{}\" does not exist", table))
}

#[async_trait]
impl MigrationBackend for MemoryBackend {
    async fn execute_script(&mut self, sql: &str) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(fragment) = state.fail_on.iter().find(|f| sql.contains(f.as_str())) {
            return Err(BackendError::new(format!("syntax error near \"{}\"", fragment)));
        }
        state.executed.push(sql.to_string());
        Ok(())
    }

    async fn tracker_exists(&mut self, table: &str) -> BackendResult<bool> {
        Ok(self.state.lock().unwrap().tables.contains_key(table))
    }

    async fn create_tracker(&mut self, table: &str) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        state.tables.entry(table.to_string()).or_insert_with(|| TrackerTable {
            rows: Vec::new(),
            next_id: 1,
        });
        Ok(())
    }

    async fn fetch_applied(&mut self, table: &str) -> BackendResult<Vec<AppliedRecord>> {
        let state = self.state.lock().unwrap();
        let table_state = state.tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(table_state.rows.clone())
    }

    async fn insert_applied(&mut self, table: &str, name: &str) -> BackendResult<AppliedRecord> {
        let mut state = self.state.lock().unwrap();
        let table_state = state.tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let record = AppliedRecord {
            id: table_state.next_id,
            name: name.to_string(),
            executed_at: Utc::now(),
        };
        table_state.next_id += 1;
        table_state.rows.push(record.clone());
        Ok(record)
    }

    async fn delete_applied(&mut self, table: &str, id: i64) -> BackendResult<u64> {
        let mut state = self.state.lock().unwrap();
        let table_state = state.tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let before = table_state.rows.len();
        table_state.rows.retain(|r| r.id != id);
        Ok((before - table_state.rows.len()) as u64)
    }

    async fn try_lock(&mut self, key: i64) -> BackendResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.lock_holder {
            Some((held, session)) if held == key && session != self.session => Ok(false),
            _ => {
                state.lock_holder = Some((key, self.session));
                Ok(true)
            }
        }
    }

    async fn unlock(&mut self, key: i64) -> BackendResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.lock_holder {
            Some((held, session)) if held == key && session == self.session => {
                state.lock_holder = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close(self: Box<Self>) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.lock_holder.map_or(false, |(_, session)| session == self.session) {
            state.lock_holder = None;
        }
        state.closed_sessions += 1;
        Ok(())
    }
}

const TABLE: &str = "migrations";

struct Fixture {
    dir: TempDir,
    config: MigrationConfig,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = MigrationConfig::new().with_migrations_dir(dir.path());
        config.lock_timeout = Duration::from_millis(0);
        Self { dir, config }
    }

    fn write(&self, name: &str, up: &str, down: Option<&str>) {
        let content = match down {
            Some(down) => format!("{}\n-- Down Migration\n{}\n", up, down),
            None => format!("{}\n", up),
        };
        fs::write(self.dir.path().join(format!("{}.sql", name)), content).unwrap();
    }

    fn remove(&self, name: &str) {
        fs::remove_file(self.dir.path().join(format!("{}.sql", name))).unwrap();
    }

    /// M1 < M2 < M3, each creating and dropping its own table
    fn three_migrations(&self) {
        self.write("001_m1", "CREATE TABLE m1 (id INT);", Some("DROP TABLE m1;"));
        self.write("002_m2", "CREATE TABLE m2 (id INT);", Some("DROP TABLE m2;"));
        self.write("003_m3", "CREATE TABLE m3 (id INT);", Some("DROP TABLE m3;"));
    }

    fn migrator(&self, backend: MemoryBackend) -> Migrator<MemoryBackend> {
        Migrator::new(&self.config, backend)
    }
}

fn names(records: &[AppliedRecord]) -> Vec<&str> {
    records.iter().map(|r| r.name.as_str()).collect()
}

#[tokio::test]
async fn test_apply_runs_pending_in_ascending_order() {
    let fixture = Fixture::new();
    fixture.three_migrations();
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());

    let report = migrator.apply().await.unwrap();

    assert_eq!(report.applied, vec!["001_m1", "002_m2", "003_m3"]);
    assert_eq!(report.skipped, 0);
    assert_eq!(
        db.executed(),
        vec![
            "CREATE TABLE m1 (id INT);",
            "CREATE TABLE m2 (id INT);",
            "CREATE TABLE m3 (id INT);"
        ]
    );
    let records = db.records(TABLE);
    assert_eq!(names(&records), vec!["001_m1", "002_m2", "003_m3"]);
    assert!(records.windows(2).all(|w| w[0].id < w[1].id));
    assert!(!db.lock_held());
}

#[tokio::test]
async fn test_apply_is_idempotent() {
    let fixture = Fixture::new();
    fixture.three_migrations();
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());

    migrator.apply().await.unwrap();
    let before = db.records(TABLE);

    let second = migrator.apply().await.unwrap();
    assert_eq!(second.applied_count(), 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(db.records(TABLE), before);
    assert_eq!(db.executed().len(), 3);
}

#[tokio::test]
async fn test_apply_on_empty_directory_creates_tracker() {
    let fixture = Fixture::new();
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());

    let report = migrator.apply().await.unwrap();
    assert_eq!(report.applied_count(), 0);
    assert!(db.records(TABLE).is_empty());
    assert!(db.has_table(TABLE));
}

#[tokio::test]
async fn test_partial_failure_keeps_prior_progress() {
    let fixture = Fixture::new();
    fixture.write("001_m1", "CREATE TABLE m1 (id INT);", Some("DROP TABLE m1;"));
    fixture.write("002_m2", "CREATE TABLEE m2 (id INT);", Some("DROP TABLE m2;"));
    fixture.write("003_m3", "CREATE TABLE m3 (id INT);", Some("DROP TABLE m3;"));
    let db = MemoryBackend::new();
    db.fail_on("TABLEE");
    let mut migrator = fixture.migrator(db.session());

    let err = migrator.apply().await.unwrap_err();

    match &err {
        MigrationError::ScriptExecution {
            name, direction, ..
        } => {
            assert_eq!(name, "002_m2");
            assert_eq!(*direction, MigrationDirection::Up);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.migration_name(), Some("002_m2"));
    assert_eq!(names(&db.records(TABLE)), vec!["001_m1"]);
    assert_eq!(db.executed(), vec!["CREATE TABLE m1 (id INT);"]);
    assert!(!db.lock_held(), "lock must be released after a failed run");
}

#[tokio::test]
async fn test_revert_runs_down_scripts_in_descending_order() {
    let fixture = Fixture::new();
    fixture.three_migrations();
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());
    migrator.apply().await.unwrap();

    let report = migrator.revert(RollbackCount::new(3)).await.unwrap();

    assert_eq!(report.reverted, vec!["003_m3", "002_m2", "001_m1"]);
    assert_eq!(
        db.executed()[3..],
        ["DROP TABLE m3;", "DROP TABLE m2;", "DROP TABLE m1;"]
    );
    assert!(db.records(TABLE).is_empty());
}

#[tokio::test]
async fn test_revert_defaults_to_latest_only() {
    let fixture = Fixture::new();
    fixture.three_migrations();
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());
    migrator.apply().await.unwrap();

    let report = migrator.revert(RollbackCount::default()).await.unwrap();
    assert_eq!(report.reverted, vec!["003_m3"]);

    let report = migrator.revert(RollbackCount::new(0)).await.unwrap();
    assert_eq!(report.reverted, vec!["002_m2"]);
    assert_eq!(names(&db.records(TABLE)), vec!["001_m1"]);
}

#[tokio::test]
async fn test_revert_count_is_clamped() {
    let fixture = Fixture::new();
    fixture.write("001_m1", "CREATE TABLE m1 (id INT);", Some("DROP TABLE m1;"));
    fixture.write("002_m2", "CREATE TABLE m2 (id INT);", Some("DROP TABLE m2;"));
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());
    migrator.apply().await.unwrap();

    let report = migrator.revert(RollbackCount::new(5)).await.unwrap();

    assert_eq!(report.reverted_count(), 2);
    assert!(!report.nothing_to_revert);
    assert!(db.records(TABLE).is_empty());
}

#[traced_test]
#[tokio::test]
async fn test_revert_forward_only_removes_record_without_script() {
    let fixture = Fixture::new();
    fixture.write("001_m1", "CREATE TABLE m1 (id INT);", None);
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());
    migrator.apply().await.unwrap();

    let report = migrator.revert(RollbackCount::default()).await.unwrap();

    assert_eq!(report.reverted, vec!["001_m1"]);
    assert_eq!(report.forward_only, vec!["001_m1"]);
    assert_eq!(db.executed(), vec!["CREATE TABLE m1 (id INT);"]);
    assert!(logs_contain("no down script for migration"));
    assert!(logs_contain("001_m1"));
    assert!(db.records(TABLE).is_empty());

    let again = migrator.apply().await.unwrap();
    assert_eq!(again.applied, vec!["001_m1"]);
}

#[traced_test]
#[tokio::test]
async fn test_revert_missing_file_only_removes_record() {
    let fixture = Fixture::new();
    fixture.three_migrations();
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());
    migrator.apply().await.unwrap();
    fixture.remove("003_m3");

    let report = migrator.revert(RollbackCount::new(2)).await.unwrap();

    assert_eq!(report.reverted, vec!["003_m3", "002_m2"]);
    assert_eq!(report.missing_files, vec!["003_m3"]);
    assert!(logs_contain("migration file not found"));
    assert!(!logs_contain("no down script for migration"));
    assert_eq!(db.executed().last().map(String::as_str), Some("DROP TABLE m2;"));
    assert_eq!(names(&db.records(TABLE)), vec!["001_m1"]);
}

#[tokio::test]
async fn test_unfilled_template_is_never_recorded() {
    let fixture = Fixture::new();
    fixture.write("001_m1", "CREATE TABLE m1 (id INT);", Some("DROP TABLE m1;"));
    let template = ScriptRepository::new(fixture.dir.path())
        .create("add users")
        .unwrap();
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());

    let err = migrator.apply().await.unwrap_err();

    assert!(matches!(err, MigrationError::InvalidMigration { ref path, .. } if *path == template));
    assert!(db.executed().is_empty());
    assert!(db.records(TABLE).is_empty());
    assert!(!db.lock_held());

    let content = fs::read_to_string(&template).unwrap();
    fs::write(&template, format!("CREATE TABLE users (id INT);\n{}", content)).unwrap();
    let report = migrator.apply().await.unwrap();
    assert_eq!(report.applied_count(), 2);
    assert!(db.executed()[1].contains("CREATE TABLE users (id INT);"));
}

#[tokio::test]
async fn test_revert_failure_stops_and_keeps_records() {
    let fixture = Fixture::new();
    fixture.write("001_m1", "CREATE TABLE m1 (id INT);", Some("DROP TABLE m1;"));
    fixture.write("002_m2", "CREATE TABLE m2 (id INT);", Some("DROP TABLE m2 CASCADEE;"));
    fixture.write("003_m3", "CREATE TABLE m3 (id INT);", Some("DROP TABLE m3;"));
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());
    migrator.apply().await.unwrap();
    db.fail_on("CASCADEE");

    let err = migrator.revert(RollbackCount::new(3)).await.unwrap_err();

    assert!(matches!(
        err,
        MigrationError::ScriptExecution { ref name, direction: MigrationDirection::Down, .. }
            if name == "002_m2"
    ));
    assert_eq!(names(&db.records(TABLE)), vec!["001_m1", "002_m2"]);
    assert!(!db.lock_held());
}

#[tokio::test]
async fn test_revert_without_tracker_is_nothing_to_roll_back() {
    let fixture = Fixture::new();
    fixture.three_migrations();
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());

    let report = migrator.revert(RollbackCount::new(2)).await.unwrap();

    assert!(report.nothing_to_revert);
    assert_eq!(report.reverted_count(), 0);
    assert!(db.executed().is_empty());
}

#[tokio::test]
async fn test_round_trip_reapplies_with_new_id() {
    let fixture = Fixture::new();
    fixture.three_migrations();
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());

    migrator.apply().await.unwrap();
    let original = db.records(TABLE);
    assert_eq!(original.len(), 3);
    let m3_id = original[2].id;

    migrator.revert(RollbackCount::new(1)).await.unwrap();
    assert_eq!(names(&db.records(TABLE)), vec!["001_m1", "002_m2"]);

    let report = migrator.apply().await.unwrap();
    assert_eq!(report.applied, vec!["003_m3"]);

    let records = db.records(TABLE);
    assert_eq!(names(&records), vec!["001_m1", "002_m2", "003_m3"]);
    assert_eq!(records[..2], original[..2]);
    assert!(records[2].id > m3_id, "ids are never reused");
}

#[tokio::test]
async fn test_new_migration_between_runs_is_applied() {
    let fixture = Fixture::new();
    fixture.write("001_m1", "CREATE TABLE m1 (id INT);", Some("DROP TABLE m1;"));
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());
    migrator.apply().await.unwrap();

    fixture.write("002_m2", "CREATE TABLE m2 (id INT);", Some("DROP TABLE m2;"));
    let report = migrator.apply().await.unwrap();

    assert_eq!(report.applied, vec!["002_m2"]);
    assert_eq!(report.skipped, 1);
}

#[tokio::test]
async fn test_status_reports_pending_applied_and_orphans() {
    let fixture = Fixture::new();
    fixture.three_migrations();
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());

    let before = migrator.status().await.unwrap();
    assert!(before.iter().all(|s| s.is_pending()));
    assert!(!db.has_table(TABLE), "status must not create the tracker");

    migrator.apply().await.unwrap();
    migrator.revert(RollbackCount::new(1)).await.unwrap();
    fixture.remove("001_m1");

    let status = migrator.status().await.unwrap();
    let summary: Vec<_> = status
        .iter()
        .map(|s| (s.name.as_str(), s.applied.is_some(), s.file_present))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("001_m1", true, false),
            ("002_m2", true, true),
            ("003_m3", false, true)
        ]
    );
}

#[tokio::test]
async fn test_discovery_error_aborts_before_any_script() {
    let fixture = Fixture::new();
    let mut config = fixture.config.clone();
    config.migrations_dir = fixture.dir.path().join("missing");
    let db = MemoryBackend::new();
    let mut migrator = Migrator::new(&config, db.session());

    let err = migrator.apply().await.unwrap_err();
    assert!(matches!(err, MigrationError::Discovery { .. }));
    assert!(db.executed().is_empty());
    assert!(!db.lock_held());
}

#[tokio::test]
async fn test_duplicate_names_abort_apply() {
    let fixture = Fixture::new();
    fixture.write("001_m1", "CREATE TABLE m1 (id INT);", None);
    fs::write(fixture.dir.path().join("001_m1.SQL"), "CREATE TABLE other (id INT);").unwrap();
    let db = MemoryBackend::new();
    let mut migrator = fixture.migrator(db.session());

    let err = migrator.apply().await.unwrap_err();
    assert!(matches!(err, MigrationError::DuplicateMigration { .. }));
    assert!(db.executed().is_empty());
}

// Concurrent runners are serialized by the advisory lock; this is stronger
// than the unlocked single-runner contract.
#[tokio::test]
async fn test_second_runner_blocked_by_advisory_lock() {
    let fixture = Fixture::new();
    fixture.three_migrations();
    let db = MemoryBackend::new();
    let mut holder = db.session();
    holder
        .try_lock(crate::lock::lock_key(TABLE))
        .await
        .unwrap();

    let mut migrator = fixture.migrator(db.session());
    let err = migrator.apply().await.unwrap_err();

    assert!(matches!(err, MigrationError::LockUnavailable { .. }));
    assert!(db.executed().is_empty());

    holder.unlock(crate::lock::lock_key(TABLE)).await.unwrap();
    assert_eq!(migrator.apply().await.unwrap().applied_count(), 3);
}

#[tokio::test]
async fn test_lock_disabled_ignores_other_runner() {
    let fixture = Fixture::new();
    fixture.three_migrations();
    let mut config = fixture.config.clone();
    config.lock = false;
    let db = MemoryBackend::new();
    let mut holder = db.session();
    holder
        .try_lock(crate::lock::lock_key(TABLE))
        .await
        .unwrap();

    let mut migrator = Migrator::new(&config, db.session());
    assert_eq!(migrator.apply().await.unwrap().applied_count(), 3);
}

#[tokio::test]
async fn test_close_releases_session() {
    let fixture = Fixture::new();
    let db = MemoryBackend::new();
    let migrator = fixture.migrator(db.session());

    migrator.close().await.unwrap();
    assert_eq!(db.closed_sessions(), 1);
}

#[tokio::test]
async fn test_failure_can_be_fixed_and_resumed() {
    let fixture = Fixture::new();
    fixture.three_migrations();
    let db = MemoryBackend::new();
    db.fail_on("m2");
    let mut migrator = fixture.migrator(db.session());

    assert!(migrator.apply().await.is_err());
    db.clear_failures();

    let report = migrator.apply().await.unwrap();
    assert_eq!(report.applied, vec!["002_m2", "003_m3"]);
    assert_eq!(report.skipped, 1);
}
