use std::path::{Path, PathBuf};

use folio_common::{Error, Result, TransactionMode};
use tracing::{debug, info};

use crate::model::AppConfig;

/// File names probed in the working directory when no path is given.
const LOCAL_CANDIDATES: &[&str] = &["folio.yml", "folio.yaml", "folio.toml"];

/// Resolves the process configuration: defaults, then a config file, then
/// `.env`, then `FOLIO_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    explicit: Option<PathBuf>,
    skip_dotenv: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this file instead of searching. It must exist.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    pub fn skip_dotenv(mut self) -> Self {
        self.skip_dotenv = true;
        self
    }

    /// Load, apply overrides and validate. Returns the config together with
    /// the file it was read from, if any.
    pub fn load(&self) -> Result<(AppConfig, Option<PathBuf>)> {
        if !self.skip_dotenv {
            match dotenvy::dotenv() {
                Ok(path) => debug!("loaded environment from {}", path.display()),
                Err(e) if e.not_found() => {}
                Err(e) => return Err(Error::Config(format!(".env parse error: {e}"))),
            }
        }

        let source = self.locate()?;
        let mut config = match &source {
            Some(path) => {
                info!("loading config from {}", path.display());
                let mut config = Self::from_file(path)?;
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    config.resolve_relative_to(dir);
                }
                config
            }
            None => {
                debug!("no config file found, using defaults");
                AppConfig::default()
            }
        };

        apply_env(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok((config, source))
    }

    fn locate(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.explicit {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }

        for name in LOCAL_CANDIDATES {
            let candidate = PathBuf::from(name);
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }

        Ok(dirs::home_dir()
            .map(|home| home.join(".folio").join("config.yml"))
            .filter(|p| p.is_file()))
    }

    /// Parse a config file, picking the format from its extension.
    pub fn from_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display()))),
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display()))),
            other => Err(Error::Config(format!(
                "unsupported config extension: {other:?}"
            ))),
        }
    }
}

/// Apply `FOLIO_*` overrides. `lookup` abstracts the environment so tests do
/// not have to mutate process state.
pub fn apply_env<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("FOLIO_DATABASE_PATH") {
        config.database.path = PathBuf::from(path);
    }
    if let Some(list) = lookup("FOLIO_NAMESPACES") {
        config.database.namespaces = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(ms) = lookup("FOLIO_BUSY_TIMEOUT_MS") {
        config.database.busy_timeout_ms = ms
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("FOLIO_BUSY_TIMEOUT_MS: {e}")))?;
    }
    if let Some(dir) = lookup("FOLIO_MIGRATIONS_DIR") {
        config.migrations.directory = Some(PathBuf::from(dir));
    }
    if let Some(table) = lookup("FOLIO_MIGRATIONS_TABLE") {
        config.migrations.table = table;
    }
    if let Some(mode) = lookup("FOLIO_TRANSACTION_MODE") {
        config.migrations.transaction_mode = mode.parse::<TransactionMode>()?;
    }
    if let Some(flag) = lookup("FOLIO_BUILTIN_MIGRATIONS") {
        config.migrations.builtin = parse_bool("FOLIO_BUILTIN_MIGRATIONS", &flag)?;
    }
    if let Some(level) = lookup("FOLIO_LOG_LEVEL") {
        config.log.level = level;
    }
    if let Some(flag) = lookup("FOLIO_LOG_JSON") {
        config.log.json = parse_bool("FOLIO_LOG_JSON", &flag)?;
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = AppConfig::default();
        apply_env(
            &mut config,
            env(&[
                ("FOLIO_DATABASE_PATH", "/var/lib/site.db"),
                ("FOLIO_NAMESPACES", "identity, crm ,"),
                ("FOLIO_TRANSACTION_MODE", "per_batch"),
                ("FOLIO_LOG_JSON", "yes"),
            ]),
        )
        .unwrap();

        assert_eq!(config.database.path, PathBuf::from("/var/lib/site.db"));
        assert_eq!(config.database.namespaces, vec!["identity", "crm"]);
        assert_eq!(config.migrations.transaction_mode, TransactionMode::PerBatch);
        assert!(config.log.json);
    }

    #[test]
    fn bad_env_values_are_config_errors() {
        let mut config = AppConfig::default();
        let err = apply_env(&mut config, env(&[("FOLIO_BUSY_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = apply_env(&mut config, env(&[("FOLIO_LOG_JSON", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("FOLIO_LOG_JSON"));
    }

    #[test]
    fn loads_yaml_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.yml");
        std::fs::write(
            &path,
            "database:\n  path: data/site.db\nmigrations:\n  directory: migrations\n",
        )
        .unwrap();

        let (config, source) = ConfigLoader::new()
            .with_path(&path)
            .skip_dotenv()
            .load()
            .unwrap();
        assert_eq!(source.as_deref(), Some(path.as_path()));
        assert_eq!(config.database.path, dir.path().join("data/site.db"));
        assert_eq!(
            config.migrations.directory,
            Some(dir.path().join("migrations"))
        );
    }

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.toml");
        std::fs::write(
            &path,
            "[database]\npath = \":memory:\"\nnamespaces = [\"crm\"]\n\n[log]\nlevel = \"debug\"\n",
        )
        .unwrap();

        let config = ConfigLoader::from_file(&path).unwrap();
        assert!(config.database.is_in_memory());
        assert_eq!(config.database.namespaces, vec!["crm"]);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = ConfigLoader::new()
            .with_path("/definitely/not/here/folio.yml")
            .skip_dotenv()
            .load()
            .unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("folio.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(ConfigLoader::from_file(&path).is_err());
    }
}
