mod commands;
mod scaffold;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use shelfmig_common::{Error, ExitStatus};
use shelfmig_config::{AppConfig, ConfigLoader, LogFormat, LoggingConfig};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shelfmig", version, about = "Versioned schema migrations for SQLite")]
struct Cli {
    /// Config file (defaults to shelfmig.yml / shelfmig.toml in the working directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Directory holding <version>_<name>.up.sql / .down.sql files
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Use the bookshelf migrations compiled into this binary
    #[arg(long, global = true)]
    embedded: bool,

    /// Tolerate applied migrations that are missing from the source
    #[arg(long, global = true)]
    allow_orphans: bool,

    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Apply pending migrations
    Up {
        /// Stop after this version
        #[arg(long)]
        to: Option<u64>,
        /// Apply pending migrations even if they sort before applied ones
        #[arg(long)]
        force: bool,
    },
    /// Revert the N most recently applied migrations
    Down {
        #[arg(default_value_t = 1)]
        n: usize,
    },
    /// Show applied, pending, drifted and orphaned migrations
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Clear a lock left behind by a crashed run
    Unlock,
    /// Create the next numbered migration file pair
    New { name: String },
}

impl Cli {
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(db) = &self.database {
            config.database.path = db.clone();
        }
        if let Some(dir) = &self.migrations_dir {
            config.migrations.dir = dir.clone();
        }
        if self.embedded {
            config.migrations.embedded = true;
        }
        if self.allow_orphans {
            config.engine.allow_orphans = true;
        }
        match self.log_format {
            Some(LogFormatArg::Json) => config.logging.format = LogFormat::Json,
            Some(LogFormatArg::Text) => config.logging.format = LogFormat::Text,
            None => {}
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(status) => ExitCode::from(status.code()),
        Err(err) => {
            let status = err
                .downcast_ref::<Error>()
                .map(Error::exit_status)
                .unwrap_or(ExitStatus::Failure);
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(status.code())
        }
    }
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let loader = ConfigLoader::new(&cwd);
    let mut config = loader.load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    init_tracing(&config.logging, cli.verbose);

    // The loader ran before the subscriber existed.
    match loader.resolve_path(cli.config.as_deref()) {
        Some(path) => info!("using config {}", path.display()),
        None => debug!("no config file in {}, using defaults", cwd.display()),
    }

    if let Command::New { name } = &cli.command {
        let created = scaffold::create(&config.migrations.dir, name)?;
        for path in created {
            println!("created {}", path.display());
        }
        return Ok(ExitStatus::Success);
    }

    let force = matches!(cli.command, Command::Up { force: true, .. });
    let migrator = commands::build_migrator(&config, force)?;

    let cancel = migrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current migration");
            cancel.cancel();
        }
    });

    let command = cli.command;
    tokio::task::spawn_blocking(move || commands::execute(&migrator, command))
        .await
        .context("migration task panicked")?
}

fn init_tracing(logging: &LoggingConfig, verbose: u8) {
    let level = match verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_up_with_target_and_globals() {
        let cli = Cli::try_parse_from([
            "shelfmig",
            "--database",
            "books.db",
            "up",
            "--to",
            "2",
            "--force",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Up {
                to: Some(2),
                force: true
            }
        ));

        let mut config = AppConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.database.path, PathBuf::from("books.db"));
    }

    #[test]
    fn down_defaults_to_one() {
        let cli = Cli::try_parse_from(["shelfmig", "down"]).unwrap();
        assert!(matches!(cli.command, Command::Down { n: 1 }));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["shelfmig", "status", "--json", "--embedded", "--allow-orphans"])
                .unwrap();
        let mut config = AppConfig::default();
        cli.apply_overrides(&mut config);
        assert!(config.migrations.embedded);
        assert!(config.engine.allow_orphans);
        assert!(matches!(cli.command, Command::Status { json: true }));
    }
}
