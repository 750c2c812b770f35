use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Create `<next>_<name>.up.sql` and `.down.sql` in `dir`, numbering after
/// the highest existing version. The up file starts out comment-only, which
/// the source rejects until real statements are written.
pub fn create(dir: &Path, name: &str) -> Result<Vec<PathBuf>> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!("migration name {name:?} may only contain letters, digits, '_' and '-'");
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create migrations directory {}", dir.display()))?;
    let version = next_version(dir)?;

    let mut created = Vec::with_capacity(2);
    for (kind, body) in [
        ("up", "-- Forward change. Runs inside one transaction.\n"),
        ("down", "-- Reverse change. Leave empty if irreversible.\n"),
    ] {
        let path = dir.join(format!("{version:04}_{name}.{kind}.sql"));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        file.write_all(body.as_bytes())?;
        created.push(path);
    }
    Ok(created)
}

fn next_version(dir: &Path) -> Result<u64> {
    let mut highest = 0;
    for entry in std::fs::read_dir(dir)? {
        let file_name = entry?.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if !file_name.ends_with(".sql") {
            continue;
        }
        let digits: String = file_name.chars().take_while(char::is_ascii_digit).collect();
        if let Ok(version) = digits.parse::<u64>() {
            highest = highest.max(version);
        }
    }
    highest
        .checked_add(1)
        .context("migration version space exhausted")
}
