use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid migration {name}: {reason}")]
    InvalidMigration { name: String, reason: String },

    /// Two identifiers cannot be placed in a single linear history.
    /// Raised while loading or planning, before anything executes.
    #[error("ordering conflict ({kind}) between {first} and {second}")]
    OrderingConflict {
        kind: ConflictKind,
        first: String,
        second: String,
    },

    #[error("migration {identifier} failed to apply: {message}")]
    ApplyFailure { identifier: String, message: String },

    #[error("migration {identifier} failed to roll back: {message}")]
    RollbackFailure {
        identifier: String,
        /// Migrations reverted by this run before the failure, newest first.
        reverted: Vec<String>,
        message: String,
    },

    #[error("ledger records {identifier} but no such migration is defined")]
    LedgerDivergence { identifier: String },

    #[error(
        "migration {identifier} changed after it was applied (recorded checksum {recorded}, current {current})"
    )]
    ChecksumMismatch {
        identifier: String,
        recorded: String,
        current: String,
    },

    #[error("refusing to roll back lossy migration {identifier}: {reason}")]
    LossyRollback { identifier: String, reason: String },

    #[error("interrupted after {} completed migration(s)", completed.len())]
    Cancelled { completed: Vec<String> },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The migration an operator should look at, if the error names one.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Error::ApplyFailure { identifier, .. }
            | Error::RollbackFailure { identifier, .. }
            | Error::LedgerDivergence { identifier }
            | Error::ChecksumMismatch { identifier, .. }
            | Error::LossyRollback { identifier, .. } => Some(identifier),
            Error::OrderingConflict { second, .. } => Some(second),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Two migrations share a timestamp.
    Collision,
    /// A declared sequence does not strictly increase.
    NonMonotonic,
    /// A pending migration sorts before the newest applied one.
    OutOfOrder,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::Collision => "timestamp collision",
            ConflictKind::NonMonotonic => "non-monotonic sequence",
            ConflictKind::OutOfOrder => "pending migration older than applied history",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let e = Error::Config("bad yaml".into());
        assert_eq!(e.to_string(), "configuration error: bad yaml");

        let e = Error::ApplyFailure {
            identifier: "20230115093000_create_users".into(),
            message: "no such table".into(),
        };
        assert_eq!(
            e.to_string(),
            "migration 20230115093000_create_users failed to apply: no such table"
        );

        let e = Error::Cancelled {
            completed: vec!["a".into(), "b".into()],
        };
        assert_eq!(e.to_string(), "interrupted after 2 completed migration(s)");

        let e = Error::Other("misc".into());
        assert_eq!(e.to_string(), "misc");
    }

    #[test]
    fn ordering_conflict_names_both_sides() {
        let e = Error::OrderingConflict {
            kind: ConflictKind::Collision,
            first: "20230101000000_a".into(),
            second: "20230101000000_b".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("timestamp collision"));
        assert!(msg.contains("20230101000000_a"));
        assert!(msg.contains("20230101000000_b"));
        assert_eq!(e.identifier(), Some("20230101000000_b"));
    }

    #[test]
    fn identifier_is_absent_for_ambient_errors() {
        assert!(Error::Database("locked".into()).identifier().is_none());
        assert!(Error::NotFound("x".into()).identifier().is_none());
    }
}
