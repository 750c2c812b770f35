use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shelfmig_common::{Error, Result};

/// Progress of a single `up` run.
#[derive(Debug)]
pub enum RunState {
    NotStarted,
    Validating,
    /// Applying the pending unit at this index of the run's pending list.
    Applying(usize),
    Committed,
    /// Terminal. The next run re-validates and resumes at the first unit
    /// still pending.
    Halted { at: u64, cause: Error },
}

impl RunState {
    pub fn is_halted(&self) -> bool {
        matches!(self, RunState::Halted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyApplied,
    BeyondTarget,
    /// The run halted or was cancelled before reaching this unit.
    NotReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum UnitStatus {
    Applied { execution_ms: u64 },
    Skipped { reason: SkipReason },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitOutcome {
    pub version: u64,
    pub name: String,
    #[serde(flatten)]
    pub status: UnitStatus,
}

/// Per-unit result of `Migrator::up`, in ascending version order.
#[derive(Debug)]
pub struct MigrationReport {
    pub outcomes: Vec<UnitOutcome>,
    pub state: RunState,
}

impl MigrationReport {
    pub fn applied(&self) -> Vec<u64> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, UnitStatus::Applied { .. }))
            .map(|o| o.version)
            .collect()
    }

    pub fn failed(&self) -> Option<&UnitOutcome> {
        self.outcomes
            .iter()
            .find(|o| matches!(o.status, UnitStatus::Failed))
    }

    pub fn is_noop(&self) -> bool {
        self.applied().is_empty() && !self.state.is_halted()
    }

    /// Turn a halted run into its error; a committed run passes through.
    pub fn into_result(self) -> Result<Self> {
        match self.state {
            RunState::Halted { cause, .. } => Err(cause),
            state => Ok(Self {
                outcomes: self.outcomes,
                state,
            }),
        }
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for outcome in &self.outcomes {
            let status = match outcome.status {
                UnitStatus::Applied { execution_ms } => format!("applied ({execution_ms} ms)"),
                UnitStatus::Skipped {
                    reason: SkipReason::AlreadyApplied,
                } => "already applied".to_string(),
                UnitStatus::Skipped {
                    reason: SkipReason::BeyondTarget,
                } => "skipped (beyond target)".to_string(),
                UnitStatus::Skipped {
                    reason: SkipReason::NotReached,
                } => "not reached".to_string(),
                UnitStatus::Failed => "FAILED".to_string(),
            };
            writeln!(f, "{:>6}  {:<32} {status}", outcome.version, outcome.name)?;
        }
        match &self.state {
            RunState::Halted { at, cause } => write!(f, "halted at {at}: {cause}"),
            _ => write!(f, "{} migration(s) applied", self.applied().len()),
        }
    }
}

/// Result of `Migrator::rollback`: versions reverted, newest first, and the
/// reason the sequence stopped early, if it did.
#[derive(Debug, Default)]
pub struct RollbackReport {
    pub reverted: Vec<u64>,
    pub halted: Option<Error>,
}

impl RollbackReport {
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Turn a halted rollback into its error. The versions already reverted
    /// stay reverted either way.
    pub fn into_result(self) -> Result<Self> {
        match self.halted {
            Some(cause) => Err(cause),
            None => Ok(self),
        }
    }
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for version in &self.reverted {
            writeln!(f, "reverted {version}")?;
        }
        match &self.halted {
            Some(cause) => write!(f, "halted: {cause}"),
            None if self.reverted.is_empty() => write!(f, "nothing to revert"),
            None => write!(f, "{} migration(s) reverted", self.reverted.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum UnitState {
    Applied { applied_at: DateTime<Utc> },
    Pending,
    /// Applied, but the source content no longer matches the recorded checksum.
    Drifted { applied_at: DateTime<Utc>, recorded: String },
    /// Recorded in the ledger but missing from the source.
    Orphaned { applied_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub version: u64,
    pub name: String,
    pub reversible: bool,
    #[serde(flatten)]
    pub state: UnitState,
}

impl fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            UnitState::Applied { applied_at } => format!("applied {}", applied_at.to_rfc3339()),
            UnitState::Pending => "pending".to_string(),
            UnitState::Drifted { .. } => "DRIFTED (edited after apply)".to_string(),
            UnitState::Orphaned { .. } => "ORPHANED (missing from source)".to_string(),
        };
        write!(f, "{:>6}  {:<32} {state}", self.version, self.name)
    }
}
