use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use shelfmig_common::{Error, Result, validate_identifier};
use tracing::debug;

use crate::unit::MigrationUnit;

/// A migration recorded as applied in the target database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedRecord {
    pub version: u64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
    pub execution_ms: u64,
}

/// The applied-state table living inside the database being migrated.
///
/// Every method takes a plain `&Connection` so callers can pass a
/// `Transaction` and have the ledger write commit together with the schema
/// change it describes.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Ledger {
    pub fn new(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ensure_exists(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                version INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                checksum TEXT NOT NULL,
                execution_ms INTEGER NOT NULL DEFAULT 0
            );",
            self.table
        ))
        .map_err(|e| Error::Database(format!("failed to create ledger table: {e}")))?;
        Ok(())
    }

    pub fn list_applied(&self, conn: &Connection) -> Result<Vec<AppliedRecord>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT version, name, applied_at, checksum, execution_ms
                 FROM {} ORDER BY version ASC",
                self.table
            ))
            .map_err(|e| Error::Database(format!("failed to prepare ledger query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(|e| Error::Database(format!("failed to read ledger: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let (version, name, applied_at, checksum, execution_ms) =
                row.map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))?;
            records.push(AppliedRecord {
                version: from_sql_version(version)?,
                name,
                applied_at: parse_timestamp(&applied_at)?,
                checksum,
                execution_ms: u64::try_from(execution_ms).unwrap_or(0),
            });
        }
        Ok(records)
    }

    pub fn record(&self, conn: &Connection, unit: &MigrationUnit, execution_ms: u64) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {} (version, name, applied_at, checksum, execution_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                self.table
            ),
            params![
                to_sql_version(unit.version())?,
                unit.name(),
                Utc::now().to_rfc3339(),
                unit.checksum(),
                i64::try_from(execution_ms).unwrap_or(i64::MAX),
            ],
        )
        .map_err(|e| {
            Error::Database(format!(
                "failed to record migration {}: {e}",
                unit.version()
            ))
        })?;
        debug!("recorded migration {} in {}", unit.version(), self.table);
        Ok(())
    }

    pub fn remove(&self, conn: &Connection, version: u64) -> Result<()> {
        let deleted = conn
            .execute(
                &format!("DELETE FROM {} WHERE version = ?1", self.table),
                params![to_sql_version(version)?],
            )
            .map_err(|e| {
                Error::Database(format!("failed to remove migration {version}: {e}"))
            })?;
        if deleted == 0 {
            return Err(Error::Database(format!(
                "migration {version} is not recorded in the ledger"
            )));
        }
        Ok(())
    }

    /// Compare the recorded checksum of `version` with `current`.
    pub fn verify_checksum(&self, conn: &Connection, version: u64, current: &str) -> Result<bool> {
        let recorded: Option<String> = conn
            .query_row(
                &format!("SELECT checksum FROM {} WHERE version = ?1", self.table),
                params![to_sql_version(version)?],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to read checksum: {e}")))?;

        match recorded {
            Some(recorded) => Ok(recorded == current),
            None => Err(Error::Database(format!(
                "migration {version} is not recorded in the ledger"
            ))),
        }
    }
}

// SQLite integers are signed 64-bit.
fn to_sql_version(version: u64) -> Result<i64> {
    i64::try_from(version)
        .map_err(|_| Error::Database(format!("migration version {version} exceeds SQLite range")))
}

fn from_sql_version(version: i64) -> Result<u64> {
    u64::try_from(version)
        .map_err(|_| Error::Database(format!("negative migration version {version} in ledger")))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("invalid applied_at timestamp {value:?}: {e}")))
}
