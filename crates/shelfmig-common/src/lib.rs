pub mod error;
pub mod ident;

pub use error::{Error, ExitStatus, Result};
pub use ident::validate_identifier;

/// Ledger table used when none is configured.
pub const DEFAULT_LEDGER_TABLE: &str = "_shelfmig_migrations";
