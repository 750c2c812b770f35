use std::ops::{Deref, DerefMut};
use std::sync::MutexGuard;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use shelfmig_common::{Error, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Exclusive hold on the database for one migration run.
///
/// The hold is a single row in a lock table, so it is visible to every
/// process that opens the same database file. The row is deleted when the
/// guard drops. The guard also owns the connection for the duration of the
/// run and derefs to it.
pub struct RunLock<'a> {
    conn: MutexGuard<'a, Connection>,
    table: String,
    holder: String,
}

impl<'a> RunLock<'a> {
    /// Insert the lock row, retrying until `timeout` elapses. A zero timeout
    /// fails fast on the first conflict.
    pub fn acquire(
        conn: MutexGuard<'a, Connection>,
        table: &str,
        timeout: Duration,
    ) -> Result<Self> {
        ensure_lock_table(&conn, table)?;

        let holder = format!("{}:{}", std::process::id(), Uuid::new_v4());
        let deadline = Instant::now() + timeout;

        loop {
            let inserted = conn.execute(
                &format!("INSERT INTO {table} (id, holder, acquired_at) VALUES (1, ?1, ?2)"),
                params![holder, Utc::now().to_rfc3339()],
            );
            match inserted {
                Ok(_) => {
                    debug!("acquired migration lock {holder}");
                    return Ok(Self {
                        conn,
                        table: table.to_string(),
                        holder,
                    });
                }
                Err(e) if is_contention(&e) => {
                    if Instant::now() >= deadline {
                        let current = current_holder(&conn, table)
                            .unwrap_or_else(|| "an unknown process".to_string());
                        return Err(Error::LockContention(current));
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(Error::Database(format!("failed to acquire lock: {e}")));
                }
            }
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Deref for RunLock<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for RunLock<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        let released = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = 1 AND holder = ?1", self.table),
            params![self.holder],
        );
        match released {
            Ok(_) => debug!("released migration lock {}", self.holder),
            Err(e) => warn!("failed to release migration lock {}: {e}", self.holder),
        }
    }
}

/// Remove a lock row left behind by a process that died mid-run.
pub fn force_unlock(conn: &Connection, table: &str) -> Result<bool> {
    ensure_lock_table(conn, table)?;
    let removed = conn
        .execute(&format!("DELETE FROM {table} WHERE id = 1"), [])
        .map_err(|e| Error::Database(format!("failed to clear lock: {e}")))?;
    if removed > 0 {
        info!("cleared stale migration lock");
    }
    Ok(removed > 0)
}

fn ensure_lock_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT NOT NULL,
            acquired_at TEXT NOT NULL
        );"
    ))
    .map_err(|e| Error::Database(format!("failed to create lock table: {e}")))
}

fn current_holder(conn: &Connection, table: &str) -> Option<String> {
    conn.query_row(
        &format!("SELECT holder, acquired_at FROM {table} WHERE id = 1"),
        [],
        |row| Ok(format!("{} since {}", row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
    )
    .optional()
    .ok()
    .flatten()
}

fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
