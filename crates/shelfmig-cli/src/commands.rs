use std::time::Duration;

use anyhow::{Context, Result, bail};
use shelfmig_common::ExitStatus;
use shelfmig_config::AppConfig;
use shelfmig_db::{DirectorySource, MigrationSource, Migrator, MigratorOptions, UnitState, bookshelf};
use tracing::info;

use crate::Command;

pub fn build_migrator(config: &AppConfig, force: bool) -> Result<Migrator> {
    let source: Box<dyn MigrationSource> = if config.migrations.embedded {
        Box::new(bookshelf::source())
    } else {
        Box::new(DirectorySource::new(&config.migrations.dir))
    };

    let options = MigratorOptions {
        ledger_table: config.engine.ledger_table.clone(),
        allow_orphans: config.engine.allow_orphans,
        allow_out_of_order: config.engine.allow_out_of_order || force,
        lock_timeout: Duration::from_secs(config.engine.lock_timeout_secs),
        busy_timeout: Duration::from_millis(config.database.busy_timeout_ms),
    };

    let migrator = Migrator::open(&config.database.path, source, options)?;
    Ok(migrator)
}

pub fn execute(migrator: &Migrator, command: Command) -> Result<ExitStatus> {
    match command {
        Command::Up { to, .. } => {
            let report = migrator.up(to)?;
            println!("{report}");
            report.into_result()?;
        }
        Command::Down { n } => {
            let report = migrator.rollback(n)?;
            println!("{report}");
            report.into_result()?;
        }
        Command::Status { json } => {
            let entries = migrator.status()?;
            if json {
                let rendered =
                    serde_json::to_string_pretty(&entries).context("failed to render status")?;
                println!("{rendered}");
            } else if entries.is_empty() {
                println!("no migrations found");
            } else {
                for entry in &entries {
                    println!("{entry}");
                }
                let pending = entries
                    .iter()
                    .filter(|e| e.state == UnitState::Pending)
                    .count();
                info!("{} migration(s), {pending} pending", entries.len());
            }
        }
        Command::Unlock => {
            if migrator.force_unlock()? {
                println!("lock cleared");
            } else {
                println!("no lock was held");
            }
        }
        Command::New { .. } => bail!("`new` does not operate on a database"),
    }
    Ok(ExitStatus::Success)
}
