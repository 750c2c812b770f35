use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("migration {version} ({name}) is recorded as applied but no longer exists in the source")]
    MissingMigration { version: u64, name: String },

    #[error(
        "migration {version} ({name}) was modified after it was applied: recorded checksum {recorded}, current {current}"
    )]
    Drift {
        version: u64,
        name: String,
        recorded: String,
        current: String,
    },

    #[error("migration {version} is pending but sorts before already applied migration {latest_applied}")]
    OutOfOrder { version: u64, latest_applied: u64 },

    #[error("migration {version} ({name}) failed: {cause}")]
    Application {
        version: u64,
        name: String,
        cause: String,
    },

    #[error("migration {version} ({name}) has no reverse action")]
    Irreversible { version: u64, name: String },

    #[error("another migration run holds the lock: {0}")]
    LockContention(String),

    #[error("migration run cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process exit codes reported by the command line shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    Validation,
    Application,
    LockContention,
    Cancelled,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
            ExitStatus::Validation => 2,
            ExitStatus::Application => 3,
            ExitStatus::LockContention => 4,
            ExitStatus::Cancelled => 130,
        }
    }
}

impl Error {
    /// Classify the error for the operator-facing exit code.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Error::Discovery(_)
            | Error::MissingMigration { .. }
            | Error::Drift { .. }
            | Error::OutOfOrder { .. }
            | Error::Irreversible { .. } => ExitStatus::Validation,
            Error::Application { .. } => ExitStatus::Application,
            Error::LockContention(_) => ExitStatus::LockContention,
            Error::Cancelled => ExitStatus::Cancelled,
            Error::Config(_) | Error::Database(_) | Error::Io(_) => ExitStatus::Failure,
        }
    }

    /// The migration version the error is about, if any.
    pub fn version(&self) -> Option<u64> {
        match self {
            Error::MissingMigration { version, .. }
            | Error::Drift { version, .. }
            | Error::OutOfOrder { version, .. }
            | Error::Application { version, .. }
            | Error::Irreversible { version, .. } => Some(*version),
            _ => None,
        }
    }
}
