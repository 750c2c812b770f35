pub mod bookshelf;
pub mod engine;
pub mod ledger;
pub mod lock;
pub mod report;
pub mod source;
pub mod unit;

pub use engine::{CancelFlag, Migrator, MigratorOptions};
pub use ledger::{AppliedRecord, Ledger};
pub use lock::RunLock;
pub use report::{
    MigrationReport, RollbackReport, RunState, SkipReason, StatusEntry, UnitOutcome, UnitState,
    UnitStatus,
};
pub use source::{DirectorySource, EmbeddedSource, MigrationDef, MigrationSource};
pub use unit::MigrationUnit;
