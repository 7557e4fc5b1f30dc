use std::collections::HashSet;
use std::path::{Path, PathBuf};

use folio_common::{Error, Result, TransactionMode, is_sql_identifier};
use serde::{Deserialize, Serialize};

/// Namespaces the site's schema is split across.
pub const DEFAULT_NAMESPACES: &[&str] = &["identity", "bookmarks", "crm", "habits"];

/// SQLite reserves these schema names for itself.
const RESERVED_NAMESPACES: &[&str] = &["main", "temp"];

/// Process-wide configuration. Loaded once at startup, read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Main database file, or `:memory:`.
    pub path: PathBuf,
    /// Schema namespaces, each attached as its own database.
    pub namespaces: Vec<String>,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio.db"),
            namespaces: DEFAULT_NAMESPACES.iter().map(|s| s.to_string()).collect(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == ":memory:"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    /// Ledger table name.
    pub table: String,
    /// Directory holding `<id>.up.sql` / `<id>.down.sql` pairs.
    pub directory: Option<PathBuf>,
    /// Include the compiled-in site schema.
    pub builtin: bool,
    pub transaction_mode: TransactionMode,
    pub verify_checksums: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            table: "folio_migrations".to_string(),
            directory: None,
            builtin: true,
            transaction_mode: TransactionMode::PerMigration,
            verify_checksums: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Reject configurations the runner cannot work with. Called once by the
    /// loader so collaborators can assume a valid config.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(Error::Config("database.path cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for ns in &self.database.namespaces {
            if !is_sql_identifier(ns) {
                return Err(Error::Config(format!(
                    "database.namespaces: {ns:?} is not a valid SQL identifier"
                )));
            }
            let lower = ns.to_ascii_lowercase();
            if RESERVED_NAMESPACES.contains(&lower.as_str()) {
                return Err(Error::Config(format!(
                    "database.namespaces: {ns:?} is reserved by SQLite"
                )));
            }
            if !seen.insert(lower) {
                return Err(Error::Config(format!(
                    "database.namespaces: {ns:?} is listed twice"
                )));
            }
        }

        if !is_sql_identifier(&self.migrations.table) {
            return Err(Error::Config(format!(
                "migrations.table: {:?} is not a valid SQL identifier",
                self.migrations.table
            )));
        }

        if !self.migrations.builtin && self.migrations.directory.is_none() {
            return Err(Error::Config(
                "no migration source: enable migrations.builtin or set migrations.directory"
                    .into(),
            ));
        }

        Ok(())
    }

    /// Resolve relative paths against the directory of the config file they
    /// were read from.
    pub fn resolve_relative_to(&mut self, base: &Path) {
        if !self.database.is_in_memory() && self.database.path.is_relative() {
            self.database.path = base.join(&self.database.path);
        }
        if let Some(dir) = &self.migrations.directory
            && dir.is_relative()
        {
            self.migrations.directory = Some(base.join(dir));
        }
    }
}
