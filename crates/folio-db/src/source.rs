//! Migrations authored as SQL files: `<id>.up.sql` and `<id>.down.sql`.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use folio_common::{Error, MigrationId, Result};
use folio_config::MigrationsConfig;
use tracing::{debug, warn};

use crate::catalog;
use crate::migration::{Migration, MigrationSet};

const UP_SUFFIX: &str = ".up.sql";
const DOWN_SUFFIX: &str = ".down.sql";
const LOSSY_DIRECTIVE: &str = "folio:lossy";

#[derive(Default)]
struct Pair {
    up: Option<String>,
    down: Option<String>,
}

/// Load every migration pair in `dir`, sorted by identifier. A missing
/// directory yields no migrations.
pub fn load_directory(dir: &Path) -> Result<Vec<Migration>> {
    if !dir.exists() {
        warn!("migrations directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut pairs: BTreeMap<String, Pair> = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };

        if let Some(stem) = file_name.strip_suffix(UP_SUFFIX) {
            pairs.entry(stem.to_string()).or_default().up = Some(std::fs::read_to_string(&path)?);
        } else if let Some(stem) = file_name.strip_suffix(DOWN_SUFFIX) {
            pairs.entry(stem.to_string()).or_default().down =
                Some(std::fs::read_to_string(&path)?);
        } else {
            debug!("ignoring {} in migrations directory", path.display());
        }
    }

    let mut migrations = Vec::with_capacity(pairs.len());
    for (stem, pair) in pairs {
        let (up, down) = match (pair.up, pair.down) {
            (Some(up), Some(down)) => (up, down),
            (None, _) => {
                return Err(Error::InvalidMigration {
                    name: stem,
                    reason: format!("missing {UP_SUFFIX} file"),
                });
            }
            (_, None) => {
                return Err(Error::InvalidMigration {
                    name: stem,
                    reason: format!("missing {DOWN_SUFFIX} file"),
                });
            }
        };

        let lossy = lossy_reason(&stem, &down)?;
        let mut migration = Migration::new(&stem, up, down)?;
        migration.lossy = lossy;
        migrations.push(migration);
    }

    debug!(count = migrations.len(), dir = %dir.display(), "loaded migration files");
    Ok(migrations)
}

/// The built-in catalog (when enabled) merged with the migrations directory
/// (when set).
pub fn load_configured(config: &MigrationsConfig) -> Result<MigrationSet> {
    let mut sources = Vec::new();
    if config.builtin {
        sources.push(catalog::builtin()?);
    }
    if let Some(dir) = &config.directory {
        sources.push(load_directory(dir)?);
    }
    MigrationSet::from_sources(sources)
}

/// Parse a `-- folio:lossy <reason>` line from a down script.
fn lossy_reason(name: &str, down: &str) -> Result<Option<String>> {
    for line in down.lines() {
        let Some(comment) = line.trim_start().strip_prefix("--") else {
            continue;
        };
        let Some(rest) = comment.trim_start().strip_prefix(LOSSY_DIRECTIVE) else {
            continue;
        };
        // `-- folio:lossyness` is an ordinary comment.
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            let reason = rest.trim();
            if reason.is_empty() {
                return Err(Error::InvalidMigration {
                    name: name.to_string(),
                    reason: format!("{LOSSY_DIRECTIVE} needs a description of what is lost"),
                });
            }
            return Ok(Some(reason.to_string()));
        }
    }
    Ok(None)
}

/// Write an empty up/down pair for a new migration called `name`.
///
/// The timestamp is `now`, or one second past the newest known migration
/// when the clock is behind it, so identifiers stay unique and increasing.
pub fn create_migration(
    dir: &Path,
    name: &str,
    known: &MigrationSet,
    now: DateTime<Utc>,
) -> Result<(MigrationId, PathBuf, PathBuf)> {
    // Identifiers carry whole seconds only.
    let now = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
    let at = match known.latest() {
        Some(latest) if latest.id.authored_at() >= now => {
            latest.id.authored_at() + Duration::seconds(1)
        }
        _ => now,
    };
    let id = MigrationId::generate(name, at)?;

    std::fs::create_dir_all(dir)?;
    let up_path = dir.join(format!("{id}{UP_SUFFIX}"));
    let down_path = dir.join(format!("{id}{DOWN_SUFFIX}"));

    write_new(&up_path, &format!("-- {id}: forward step.\n"))?;
    let down = write_new(
        &down_path,
        &format!(
            "-- Reverts {id}.\n\
             -- If the forward step destroys data, start a comment line with\n\
             -- the {LOSSY_DIRECTIVE} directive followed by what cannot be restored.\n"
        ),
    );
    if let Err(e) = down {
        // A lone up file would make every later load fail.
        if let Err(cleanup) = std::fs::remove_file(&up_path) {
            warn!("failed to remove {}: {cleanup}", up_path.display());
        }
        return Err(e);
    }

    Ok((id, up_path, down_path))
}

fn write_new(path: &Path, contents: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Error::Other(format!("cannot create {}: {e}", path.display())))?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}
