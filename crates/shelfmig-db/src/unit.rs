use ring::digest::{SHA256, digest};
use shelfmig_common::{Error, Result};

/// Versions are stored as SQLite integers, which are signed 64-bit.
pub const MAX_VERSION: u64 = i64::MAX as u64;

/// One versioned schema change.
///
/// Units are built once by a [`MigrationSource`](crate::MigrationSource) and
/// never mutated afterwards. The checksum covers the forward action only, so
/// editing a reverse action does not count as drift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    version: u64,
    name: String,
    forward: String,
    reverse: Option<String>,
    checksum: String,
}

impl MigrationUnit {
    pub fn new(
        version: u64,
        name: impl Into<String>,
        forward: impl Into<String>,
        reverse: Option<String>,
    ) -> Result<Self> {
        let name = name.into();
        let forward = forward.into();

        if version > MAX_VERSION {
            return Err(Error::Discovery(format!(
                "migration {version} ({name}) exceeds the largest storable version {MAX_VERSION}"
            )));
        }
        if !has_statements(&forward) {
            return Err(Error::Discovery(format!(
                "migration {version} ({name}) has an empty forward action"
            )));
        }

        // A blank down file means "no way back", same as no file at all.
        let reverse = reverse.filter(|sql| has_statements(sql));
        let checksum = checksum_of(&forward);

        Ok(Self {
            version,
            name,
            forward,
            reverse,
            checksum,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn forward(&self) -> &str {
        &self.forward
    }

    pub fn reverse(&self) -> Option<&str> {
        self.reverse.as_deref()
    }

    pub fn is_reversible(&self) -> bool {
        self.reverse.is_some()
    }

    /// Lowercase hex SHA-256 of the forward action.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

pub fn checksum_of(sql: &str) -> String {
    let hash = digest(&SHA256, sql.as_bytes());
    hash.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

/// True when `sql` holds anything besides whitespace and comments.
fn has_statements(sql: &str) -> bool {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            return !rest.is_empty();
        }
    }
}
