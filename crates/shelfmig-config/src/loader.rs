use std::path::{Path, PathBuf};

use shelfmig_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_FILE_NAMES: [&str; 3] = ["shelfmig.yml", "shelfmig.yaml", "shelfmig.toml"];

pub const ENV_DATABASE: &str = "SHELFMIG_DATABASE";
pub const ENV_MIGRATIONS_DIR: &str = "SHELFMIG_MIGRATIONS_DIR";
pub const ENV_LEDGER_TABLE: &str = "SHELFMIG_LEDGER_TABLE";

/// Resolves the effective configuration: file (explicit or discovered),
/// then defaults, then environment overrides.
pub struct ConfigLoader {
    search_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(search_dir: impl Into<PathBuf>) -> Self {
        Self {
            search_dir: search_dir.into(),
        }
    }

    /// Load from `explicit` when given, otherwise from the first known config
    /// file in the search directory. Missing files fall back to defaults.
    pub fn load(&self, explicit: Option<&Path>) -> Result<AppConfig> {
        self.load_with_env(explicit, |key| std::env::var(key).ok())
    }

    pub fn load_with_env<F>(&self, explicit: Option<&Path>, lookup: F) -> Result<AppConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
        }

        let mut config = match self.resolve_path(explicit) {
            Some(path) => parse_file(&path)?,
            None => {
                debug!(
                    "no config file in {}, using defaults",
                    self.search_dir.display()
                );
                AppConfig::default()
            }
        };

        apply_env_overrides(&mut config, lookup);
        config.validate()?;
        Ok(config)
    }

    /// The file `load` reads: `explicit` when given, otherwise the first
    /// known config file in the search directory.
    pub fn resolve_path(&self, explicit: Option<&Path>) -> Option<PathBuf> {
        match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => self.discover(),
        }
    }

    fn discover(&self) -> Option<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| self.search_dir.join(name))
            .find(|path| path.is_file())
    }
}

pub fn parse_file(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let config = match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display())))?,
        "toml" => toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display())))?,
        other => {
            return Err(Error::Config(format!(
                "unsupported config extension: {other}"
            )));
        }
    };

    info!("loaded config from {}", path.display());
    Ok(config)
}

fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(db) = lookup(ENV_DATABASE).filter(|v| !v.is_empty()) {
        config.database.path = PathBuf::from(db);
    }
    if let Some(dir) = lookup(ENV_MIGRATIONS_DIR).filter(|v| !v.is_empty()) {
        config.migrations.dir = PathBuf::from(dir);
    }
    if let Some(table) = lookup(ENV_LEDGER_TABLE).filter(|v| !v.is_empty()) {
        config.engine.ledger_table = table;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::LogFormat;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new(dir.path())
            .load_with_env(None, no_env)
            .unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn discovers_yaml_in_search_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("shelfmig.yml"),
            "database:\n  path: /tmp/books.db\nengine:\n  allow_orphans: true\nlogging:\n  format: json\n",
        )
        .unwrap();

        let config = ConfigLoader::new(dir.path())
            .load_with_env(None, no_env)
            .unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/books.db"));
        assert!(config.engine.allow_orphans);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.migrations.dir, PathBuf::from("migrations"));
    }

    #[test]
    fn parses_explicit_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[migrations]\ndir = \"db/migrations\"\n\n[engine]\nlock_timeout_secs = 10\n",
        )
        .unwrap();

        let config = ConfigLoader::new(dir.path())
            .load_with_env(Some(&path), no_env)
            .unwrap();
        assert_eq!(config.migrations.dir, PathBuf::from("db/migrations"));
        assert_eq!(config.engine.lock_timeout_secs, 10);
    }

    #[test]
    fn resolve_path_prefers_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::new(dir.path());
        assert_eq!(loader.resolve_path(None), None);

        std::fs::write(dir.path().join("shelfmig.toml"), "").unwrap();
        assert_eq!(
            loader.resolve_path(None),
            Some(dir.path().join("shelfmig.toml"))
        );

        let explicit = dir.path().join("other.yml");
        assert_eq!(loader.resolve_path(Some(explicit.as_path())), Some(explicit.clone()));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new(dir.path())
            .load_with_env(Some(&dir.path().join("nope.yml")), no_env)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_win_over_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shelfmig.toml"), "[database]\npath = \"a.db\"\n").unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_DATABASE, "b.db"),
            (ENV_LEDGER_TABLE, "schema_history"),
        ]);
        let config = ConfigLoader::new(dir.path())
            .load_with_env(None, |k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database.path, PathBuf::from("b.db"));
        assert_eq!(config.engine.ledger_table, "schema_history");
    }

    #[test]
    fn invalid_ledger_table_from_env_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigLoader::new(dir.path()).load_with_env(None, |k| {
            (k == ENV_LEDGER_TABLE).then(|| "bad name".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shelfmig.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(parse_file(&path).is_err());
    }
}
