use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use shelfmig_common::{Error, Result};
use tracing::debug;

use crate::unit::MigrationUnit;

static FILE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<version>\d+)_(?P<name>[A-Za-z0-9_\-]+)\.(?P<kind>up|down)\.sql$")
        .expect("migration file name pattern is valid")
});

/// Enumerates every migration unit available to the running process.
///
/// Implementations must be deterministic for a fixed input set and return
/// units sorted ascending by version. Duplicate versions are an error.
pub trait MigrationSource: Send + Sync {
    fn list_all(&self) -> Result<Vec<MigrationUnit>>;
}

/// Sort by version and reject duplicates. Every source funnels through here.
fn into_ordered(mut units: Vec<MigrationUnit>) -> Result<Vec<MigrationUnit>> {
    units.sort_by_key(MigrationUnit::version);
    for pair in units.windows(2) {
        if pair[0].version() == pair[1].version() {
            return Err(Error::Discovery(format!(
                "duplicate migration version {}: {} and {}",
                pair[0].version(),
                pair[0].name(),
                pair[1].name()
            )));
        }
    }
    Ok(units)
}

impl MigrationSource for Vec<MigrationUnit> {
    fn list_all(&self) -> Result<Vec<MigrationUnit>> {
        into_ordered(self.clone())
    }
}

/// A migration definition compiled into the binary.
#[derive(Debug, Clone, Copy)]
pub struct MigrationDef {
    pub version: u64,
    pub name: &'static str,
    pub up: &'static str,
    pub down: Option<&'static str>,
}

pub struct EmbeddedSource {
    defs: &'static [MigrationDef],
}

impl EmbeddedSource {
    pub fn new(defs: &'static [MigrationDef]) -> Self {
        Self { defs }
    }
}

impl MigrationSource for EmbeddedSource {
    fn list_all(&self) -> Result<Vec<MigrationUnit>> {
        let units = self
            .defs
            .iter()
            .map(|def| {
                MigrationUnit::new(def.version, def.name, def.up, def.down.map(str::to_string))
            })
            .collect::<Result<Vec<_>>>()?;
        into_ordered(units)
    }
}

/// Reads `<version>_<name>.up.sql` files, each with an optional
/// `<version>_<name>.down.sql` companion, from one flat directory.
pub struct DirectorySource {
    dir: PathBuf,
}

#[derive(Default)]
struct FilePair {
    stem: String,
    name: String,
    up: Option<PathBuf>,
    down: Option<PathBuf>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn collect_pairs(&self) -> Result<BTreeMap<u64, FilePair>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            Error::Discovery(format!(
                "cannot read migrations directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut pairs: BTreeMap<u64, FilePair> = BTreeMap::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
                continue;
            };
            if !file_name.ends_with(".sql") {
                debug!("ignoring non-sql file {file_name} in migrations directory");
                continue;
            }

            let caps = FILE_NAME.captures(file_name).ok_or_else(|| {
                Error::Discovery(format!(
                    "malformed migration file name {file_name}: expected <version>_<name>.up.sql or .down.sql"
                ))
            })?;
            let version: u64 = caps["version"].parse().map_err(|_| {
                Error::Discovery(format!("migration version out of range in {file_name}"))
            })?;
            let stem = format!("{}_{}", &caps["version"], &caps["name"]);

            let pair = pairs.entry(version).or_insert_with(|| FilePair {
                stem: stem.clone(),
                name: caps["name"].to_string(),
                ..FilePair::default()
            });
            if pair.stem != stem {
                return Err(Error::Discovery(format!(
                    "duplicate migration version {version}: {} and {stem}",
                    pair.stem
                )));
            }
            match &caps["kind"] {
                "up" => pair.up = Some(path.clone()),
                _ => pair.down = Some(path.clone()),
            }
        }
        Ok(pairs)
    }
}

impl MigrationSource for DirectorySource {
    fn list_all(&self) -> Result<Vec<MigrationUnit>> {
        let mut units = Vec::new();
        for (version, pair) in self.collect_pairs()? {
            let up = pair.up.ok_or_else(|| {
                Error::Discovery(format!(
                    "migration {} has a down file but no {}.up.sql",
                    pair.stem, pair.stem
                ))
            })?;
            let forward = std::fs::read_to_string(&up)?;
            let reverse = match pair.down {
                Some(path) => Some(std::fs::read_to_string(path)?),
                None => None,
            };
            units.push(MigrationUnit::new(version, pair.name, forward, reverse)?);
        }

        debug!(
            "discovered {} migrations in {}",
            units.len(),
            self.dir.display()
        );
        into_ordered(units)
    }
}
