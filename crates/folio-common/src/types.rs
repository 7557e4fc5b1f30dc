use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

static SQL_IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("sql pattern is valid"));

static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{14})_([a-z0-9][a-z0-9_]*)$").expect("identifier pattern is valid")
});

/// Identifier of a migration: `<YYYYMMDDHHMMSS>_<snake_case_name>`.
///
/// The timestamp prefix has a fixed width, so the lexicographic order of
/// identifiers is also their chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationId(String);

impl MigrationId {
    pub fn parse(raw: &str) -> Result<Self> {
        let caps = IDENTIFIER_RE
            .captures(raw)
            .ok_or_else(|| Error::InvalidMigration {
                name: raw.to_string(),
                reason: "identifier must look like YYYYMMDDHHMMSS_snake_case_name".into(),
            })?;

        NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT).map_err(|e| {
            Error::InvalidMigration {
                name: raw.to_string(),
                reason: format!("timestamp prefix is not a valid date: {e}"),
            }
        })?;

        Ok(Self(raw.to_string()))
    }

    /// Build an identifier for a new migration authored at `at`.
    pub fn generate(name: &str, at: DateTime<Utc>) -> Result<Self> {
        Self::parse(&format!("{}_{}", at.format(TIMESTAMP_FORMAT), name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 14-digit timestamp prefix.
    pub fn timestamp(&self) -> &str {
        &self.0[..14]
    }

    pub fn name(&self) -> &str {
        &self.0[15..]
    }

    pub fn authored_at(&self) -> DateTime<Utc> {
        // The prefix was validated in `parse`.
        NaiveDateTime::parse_from_str(self.timestamp(), TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .unwrap_or_default()
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MigrationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MigrationId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<MigrationId> for String {
    fn from(id: MigrationId) -> Self {
        id.0
    }
}

impl AsRef<str> for MigrationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether `name` can be interpolated into SQL as a bare identifier
/// (table or schema namespace name).
pub fn is_sql_identifier(name: &str) -> bool {
    SQL_IDENT_RE.is_match(name)
}

/// How the runner groups migrations into database transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Each migration and its ledger row commit together.
    #[default]
    PerMigration,
    /// The whole batch commits or rolls back as one unit.
    PerBatch,
}

impl FromStr for TransactionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "per_migration" | "migration" => Ok(TransactionMode::PerMigration),
            "per_batch" | "batch" => Ok(TransactionMode::PerBatch),
            other => Err(Error::Config(format!("unknown transaction mode: {other}"))),
        }
    }
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionMode::PerMigration => f.write_str("per_migration"),
            TransactionMode::PerBatch => f.write_str("per_batch"),
        }
    }
}
