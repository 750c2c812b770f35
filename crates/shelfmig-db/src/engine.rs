use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rusqlite::{Connection, TransactionBehavior};
use shelfmig_common::{DEFAULT_LEDGER_TABLE, Error, Result};
use tracing::{debug, error, info, warn};

use crate::ledger::{AppliedRecord, Ledger};
use crate::lock::{self, RunLock};
use crate::report::{
    MigrationReport, RollbackReport, RunState, SkipReason, StatusEntry, UnitOutcome, UnitState,
    UnitStatus,
};
use crate::source::MigrationSource;
use crate::unit::MigrationUnit;

#[derive(Debug, Clone)]
pub struct MigratorOptions {
    pub ledger_table: String,
    /// Tolerate ledger entries whose migration is gone from the source.
    pub allow_orphans: bool,
    /// Apply pending units that sort below the newest applied one.
    pub allow_out_of_order: bool,
    /// How long to wait for a concurrent run. Zero fails fast.
    pub lock_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for MigratorOptions {
    fn default() -> Self {
        Self {
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            allow_orphans: false,
            allow_out_of_order: false,
            lock_timeout: Duration::ZERO,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Operator interrupt, observed only between units.
///
/// The run that observes a cancellation consumes it, so the same `Migrator`
/// can run again afterwards.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Applies migrations from a source to one SQLite database, tracking them in
/// a ledger table inside that same database.
pub struct Migrator {
    conn: Mutex<Connection>,
    source: Box<dyn MigrationSource>,
    ledger: Ledger,
    options: MigratorOptions,
    cancel: CancelFlag,
}

impl Migrator {
    pub fn open(
        db_path: &Path,
        source: Box<dyn MigrationSource>,
        options: MigratorOptions,
    ) -> Result<Self> {
        info!("opening database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::new(conn, source, options)
    }

    pub fn in_memory(source: Box<dyn MigrationSource>, options: MigratorOptions) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Self::new(conn, source, options)
    }

    pub fn new(
        conn: Connection,
        source: Box<dyn MigrationSource>,
        options: MigratorOptions,
    ) -> Result<Self> {
        conn.busy_timeout(options.busy_timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        let ledger = Ledger::new(options.ledger_table.clone())?;

        Ok(Self {
            conn: Mutex::new(conn),
            source,
            ledger,
            options,
            cancel: CancelFlag::default(),
        })
    }

    /// A handle that stops the current run at the next unit boundary.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Run `f` against the underlying connection, outside of any run.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connection()?;
        f(&conn)
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("migrator connection lock poisoned".into()))
    }

    fn lock_table(&self) -> String {
        format!("{}_lock", self.ledger.table())
    }

    fn acquire(&self) -> Result<RunLock<'_>> {
        RunLock::acquire(
            self.connection()?,
            &self.lock_table(),
            self.options.lock_timeout,
        )
    }

    /// Apply every pending migration up to and including `target` (all when
    /// `None`).
    ///
    /// Validation problems come back as `Err` before anything is touched. A
    /// unit that fails to apply, or a cancellation, halts the run: the report
    /// is returned with [`RunState::Halted`] and every earlier unit stays
    /// committed.
    pub fn up(&self, target: Option<u64>) -> Result<MigrationReport> {
        let mut state = RunState::NotStarted;
        debug!(?state, "starting migration run");

        let mut conn = self.acquire()?;
        state = RunState::Validating;
        debug!(?state);

        self.ledger.ensure_exists(&conn)?;
        let applied = self.ledger.list_applied(&conn)?;
        let all = self.source.list_all()?;

        self.check_orphans(&applied, &all)?;
        check_drift(&applied, &all)?;

        if let Some(target) = target {
            if !all.iter().any(|u| u.version() == target) {
                return Err(Error::Discovery(format!(
                    "target migration {target} does not exist"
                )));
            }
        }

        let applied_versions: HashSet<u64> = applied.iter().map(|r| r.version).collect();
        let latest_applied = applied.last().map(|r| r.version);

        let mut outcomes = Vec::with_capacity(all.len());
        let mut pending: Vec<(usize, &MigrationUnit)> = Vec::new();
        for unit in &all {
            let status = if applied_versions.contains(&unit.version()) {
                UnitStatus::Skipped {
                    reason: SkipReason::AlreadyApplied,
                }
            } else if target.is_some_and(|t| unit.version() > t) {
                UnitStatus::Skipped {
                    reason: SkipReason::BeyondTarget,
                }
            } else {
                if let Some(latest) = latest_applied {
                    if unit.version() < latest && !self.options.allow_out_of_order {
                        return Err(Error::OutOfOrder {
                            version: unit.version(),
                            latest_applied: latest,
                        });
                    }
                }
                pending.push((outcomes.len(), unit));
                UnitStatus::Skipped {
                    reason: SkipReason::NotReached,
                }
            };
            outcomes.push(UnitOutcome {
                version: unit.version(),
                name: unit.name().to_string(),
                status,
            });
        }

        if pending.is_empty() {
            info!("database is up to date");
        } else {
            info!("{} pending migration(s)", pending.len());
        }

        for (index, (slot, unit)) in pending.iter().enumerate() {
            if self.cancel.take() {
                warn!("run cancelled before migration {}", unit.version());
                state = RunState::Halted {
                    at: unit.version(),
                    cause: Error::Cancelled,
                };
                break;
            }

            state = RunState::Applying(index);
            debug!(?state);
            info!("applying migration {} ({})", unit.version(), unit.name());

            match self.apply_one(&mut conn, unit) {
                Ok(execution_ms) => {
                    outcomes[*slot].status = UnitStatus::Applied { execution_ms };
                }
                Err(cause) => {
                    error!("migration {} failed: {cause}", unit.version());
                    outcomes[*slot].status = UnitStatus::Failed;
                    state = RunState::Halted {
                        at: unit.version(),
                        cause,
                    };
                    break;
                }
            }
        }

        if !state.is_halted() {
            state = RunState::Committed;
        }
        debug!(?state, "migration run finished");

        Ok(MigrationReport { outcomes, state })
    }

    /// Forward action and ledger record in one transaction. Any error drops
    /// the transaction, which rolls both back.
    fn apply_one(&self, conn: &mut Connection, unit: &MigrationUnit) -> Result<u64> {
        let started = Instant::now();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| application_error(unit, e))?;

        tx.execute_batch(unit.forward())
            .map_err(|e| application_error(unit, e))?;

        let execution_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.ledger
            .record(&tx, unit, execution_ms)
            .map_err(|e| application_error(unit, e))?;

        tx.commit().map_err(|e| application_error(unit, e))?;
        Ok(execution_ms)
    }

    /// Revert the `n` most recently applied migrations, newest first, each in
    /// its own transaction.
    ///
    /// Lock and ledger problems come back as `Err`. A unit that cannot be
    /// reverted, or a cancellation, halts the sequence: the report keeps the
    /// versions already reverted (they stay reverted) and carries the cause.
    pub fn rollback(&self, n: usize) -> Result<RollbackReport> {
        let mut report = RollbackReport::default();
        if n == 0 {
            return Ok(report);
        }

        let mut conn = self.acquire()?;
        self.ledger.ensure_exists(&conn)?;
        let applied = self.ledger.list_applied(&conn)?;
        let all = self.source.list_all()?;
        let by_version: HashMap<u64, &MigrationUnit> =
            all.iter().map(|u| (u.version(), u)).collect();

        for record in applied.iter().rev().take(n) {
            if self.cancel.take() {
                warn!("rollback cancelled before migration {}", record.version);
                report.halted = Some(Error::Cancelled);
                break;
            }

            match self.revert_one(&mut conn, record, &by_version) {
                Ok(version) => report.reverted.push(version),
                Err(cause) => {
                    error!("cannot revert migration {}: {cause}", record.version);
                    report.halted = Some(cause);
                    break;
                }
            }
        }

        Ok(report)
    }

    fn revert_one(
        &self,
        conn: &mut Connection,
        record: &AppliedRecord,
        by_version: &HashMap<u64, &MigrationUnit>,
    ) -> Result<u64> {
        let unit = by_version
            .get(&record.version)
            .ok_or_else(|| Error::MissingMigration {
                version: record.version,
                name: record.name.clone(),
            })?;

        if !self
            .ledger
            .verify_checksum(conn, unit.version(), unit.checksum())?
        {
            return Err(Error::Drift {
                version: unit.version(),
                name: unit.name().to_string(),
                recorded: record.checksum.clone(),
                current: unit.checksum().to_string(),
            });
        }

        let reverse = unit.reverse().ok_or_else(|| Error::Irreversible {
            version: unit.version(),
            name: unit.name().to_string(),
        })?;

        info!("reverting migration {} ({})", unit.version(), unit.name());
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| application_error(unit, e))?;
        tx.execute_batch(reverse)
            .map_err(|e| application_error(unit, e))?;
        self.ledger
            .remove(&tx, unit.version())
            .map_err(|e| application_error(unit, e))?;
        tx.commit().map_err(|e| application_error(unit, e))?;

        Ok(unit.version())
    }

    /// Source and ledger merged by version. Read-only apart from creating the
    /// ledger table, so it does not take the run lock.
    pub fn status(&self) -> Result<Vec<StatusEntry>> {
        let conn = self.connection()?;
        self.ledger.ensure_exists(&conn)?;
        let applied = self.ledger.list_applied(&conn)?;
        drop(conn);
        let all = self.source.list_all()?;

        let mut records: BTreeMap<u64, AppliedRecord> =
            applied.into_iter().map(|r| (r.version, r)).collect();
        let mut entries: BTreeMap<u64, StatusEntry> = BTreeMap::new();

        for unit in &all {
            let state = match records.remove(&unit.version()) {
                Some(record) if record.checksum != unit.checksum() => UnitState::Drifted {
                    applied_at: record.applied_at,
                    recorded: record.checksum,
                },
                Some(record) => UnitState::Applied {
                    applied_at: record.applied_at,
                },
                None => UnitState::Pending,
            };
            entries.insert(
                unit.version(),
                StatusEntry {
                    version: unit.version(),
                    name: unit.name().to_string(),
                    reversible: unit.is_reversible(),
                    state,
                },
            );
        }

        for (version, record) in records {
            entries.insert(
                version,
                StatusEntry {
                    version,
                    name: record.name,
                    reversible: false,
                    state: UnitState::Orphaned {
                        applied_at: record.applied_at,
                    },
                },
            );
        }

        Ok(entries.into_values().collect())
    }

    /// Clear a lock left behind by a crashed run.
    pub fn force_unlock(&self) -> Result<bool> {
        let conn = self.connection()?;
        lock::force_unlock(&conn, &self.lock_table())
    }

    fn check_orphans(&self, applied: &[AppliedRecord], all: &[MigrationUnit]) -> Result<()> {
        let known: HashSet<u64> = all.iter().map(MigrationUnit::version).collect();
        for record in applied.iter().filter(|r| !known.contains(&r.version)) {
            if self.options.allow_orphans {
                warn!(
                    "migration {} ({}) is applied but missing from the source",
                    record.version, record.name
                );
                continue;
            }
            return Err(Error::MissingMigration {
                version: record.version,
                name: record.name.clone(),
            });
        }
        Ok(())
    }
}

fn check_drift(applied: &[AppliedRecord], all: &[MigrationUnit]) -> Result<()> {
    let recorded: HashMap<u64, &AppliedRecord> = applied.iter().map(|r| (r.version, r)).collect();
    for unit in all {
        if let Some(record) = recorded.get(&unit.version()) {
            if record.checksum != unit.checksum() {
                return Err(Error::Drift {
                    version: unit.version(),
                    name: unit.name().to_string(),
                    recorded: record.checksum.clone(),
                    current: unit.checksum().to_string(),
                });
            }
        }
    }
    Ok(())
}

fn application_error(unit: &MigrationUnit, cause: impl std::fmt::Display) -> Error {
    Error::Application {
        version: unit.version(),
        name: unit.name().to_string(),
        cause: cause.to_string(),
    }
}
