use std::collections::HashSet;
use std::fmt::Write as _;

use folio_common::{ConflictKind, Error, MigrationId, Result};
use ring::digest::{SHA256, digest};

/// One step of the schema history: a forward script and the script that
/// reverts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub id: MigrationId,
    pub up: String,
    pub down: String,
    /// Why `down` cannot restore the data `up` destroyed. `None` means the
    /// migration is fully reversible.
    pub lossy: Option<String>,
}

impl Migration {
    /// Scripts run inside a transaction the runner owns, so they may not
    /// begin, commit or roll back one themselves.
    pub fn new(id: &str, up: impl Into<String>, down: impl Into<String>) -> Result<Self> {
        let (up, down) = (up.into(), down.into());
        for (label, script) in [("up", &up), ("down", &down)] {
            if let Some(keyword) = transaction_control(script) {
                return Err(Error::InvalidMigration {
                    name: id.to_string(),
                    reason: format!("{label} script contains a {keyword} statement"),
                });
            }
        }
        Ok(Self {
            id: MigrationId::parse(id)?,
            up,
            down,
            lossy: None,
        })
    }

    pub fn lossy(mut self, reason: impl Into<String>) -> Self {
        self.lossy = Some(reason.into());
        self
    }

    pub fn is_lossy(&self) -> bool {
        self.lossy.is_some()
    }

    /// Hex SHA-256 of the forward script, recorded in the ledger.
    pub fn checksum(&self) -> String {
        let hash = digest(&SHA256, self.up.as_bytes());
        let mut hex = String::with_capacity(64);
        for byte in hash.as_ref() {
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }
}

/// The validated, totally ordered list of known migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    /// Accept a sequence in its declared order. Timestamps must strictly
    /// increase: equal timestamps are a collision, a decrease is a
    /// non-monotonic sequence.
    pub fn new(migrations: Vec<Migration>) -> Result<Self> {
        check_strictly_increasing(&migrations)?;
        Ok(Self { migrations })
    }

    /// Merge several independently ordered sources (the built-in catalog and
    /// a migrations directory). Each source is checked in its own order, then
    /// the union is checked for collisions between sources.
    pub fn from_sources(sources: Vec<Vec<Migration>>) -> Result<Self> {
        let mut all = Vec::new();
        for source in sources {
            check_strictly_increasing(&source)?;
            all.extend(source);
        }
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Self::new(all)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn get(&self, id: &MigrationId) -> Option<&Migration> {
        self.migrations
            .binary_search_by(|m| m.id.cmp(id))
            .ok()
            .map(|idx| &self.migrations[idx])
    }

    pub fn latest(&self) -> Option<&Migration> {
        self.migrations.last()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

const TRANSACTION_KEYWORDS: &[&str] = &["BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE"];

/// First transaction-control keyword that starts a statement in `sql`.
/// `BEGIN ... END` inside a `CREATE TRIGGER` body is not one.
fn transaction_control(sql: &str) -> Option<&'static str> {
    let mut in_trigger = false;
    for statement in sql.split(';') {
        let words: Vec<String> = strip_comments(statement)
            .split_whitespace()
            .take(4)
            .map(str::to_ascii_uppercase)
            .collect();
        let Some(first) = words.first() else {
            continue;
        };

        if in_trigger {
            if first == "END" && words.len() == 1 {
                in_trigger = false;
            }
            continue;
        }
        if first == "CREATE" && words.iter().any(|w| w == "TRIGGER") {
            in_trigger = true;
            continue;
        }
        if let Some(keyword) = TRANSACTION_KEYWORDS.iter().copied().find(|k| *k == first.as_str()) {
            return Some(keyword);
        }
    }
    None
}

/// Drop `--` line comments and `/* */` block comments.
fn strip_comments(statement: &str) -> String {
    let mut out = String::with_capacity(statement.len());
    let mut rest = statement;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.find('\n').map_or("", |i| &after[i..]);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.find("*/").map_or("", |i| &after[i + 2..]);
            out.push(' ');
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
    }
    out
}

fn check_strictly_increasing(migrations: &[Migration]) -> Result<()> {
    let mut seen = HashSet::new();
    for m in migrations {
        if !seen.insert(m.id.timestamp()) {
            let first = migrations
                .iter()
                .find(|other| other.id.timestamp() == m.id.timestamp())
                .map(|other| other.id.to_string())
                .unwrap_or_default();
            return Err(Error::OrderingConflict {
                kind: ConflictKind::Collision,
                first,
                second: m.id.to_string(),
            });
        }
    }

    for pair in migrations.windows(2) {
        if pair[0].id >= pair[1].id {
            return Err(Error::OrderingConflict {
                kind: ConflictKind::NonMonotonic,
                first: pair[0].id.to_string(),
                second: pair[1].id.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(id: &str) -> Migration {
        Migration::new(id, "SELECT 1;", "SELECT 1;").unwrap()
    }

    #[test]
    fn checksum_is_stable_hex_sha256() {
        let a = m("20230101000000_a");
        assert_eq!(a.checksum().len(), 64);
        assert_eq!(a.checksum(), m("20230101000000_a").checksum());

        let empty = Migration::new("20230101000000_a", "", "").unwrap();
        assert_eq!(
            empty.checksum(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn checksum_changes_with_up_script_only() {
        let a = m("20230101000000_a");
        let mut b = a.clone();
        b.down = "DROP TABLE x;".into();
        assert_eq!(a.checksum(), b.checksum());
        b.up = "CREATE TABLE x (id INTEGER);".into();
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn scripts_may_not_control_the_transaction() {
        for script in [
            "CREATE TABLE half (id INTEGER); COMMIT; INSERT INTO nope VALUES (1);",
            "begin transaction; CREATE TABLE t (id INTEGER);",
            "CREATE TABLE t (id INTEGER);\n-- done\nEND",
            "SAVEPOINT s1; CREATE TABLE t (id INTEGER); RELEASE s1;",
            "/* undo */ ROLLBACK;",
        ] {
            let err = Migration::new("20230101000000_bad", script, "SELECT 1;").unwrap_err();
            assert!(matches!(err, Error::InvalidMigration { .. }), "{script}");
        }

        let err = Migration::new("20230101000000_bad", "SELECT 1;", "DROP TABLE t; COMMIT;")
            .unwrap_err();
        assert!(err.to_string().contains("down script contains a COMMIT statement"));
    }

    #[test]
    fn trigger_bodies_and_comments_are_not_transaction_control() {
        let up = "
            CREATE TABLE t (id INTEGER, touched TEXT);
            -- commit log below
            CREATE TRIGGER t_touch AFTER UPDATE ON t BEGIN
                UPDATE t SET touched = datetime('now') WHERE id = NEW.id;
            END;
            CREATE INDEX idx_end ON t(touched);
        ";
        assert!(Migration::new("20230101000000_trigger", up, "DROP TABLE t;").is_ok());
        assert!(Migration::new("20230101000000_note", "/* COMMIT */ SELECT 1;", "").is_ok());
    }

    #[test]
    fn accepts_strictly_increasing_sequence() {
        let set = MigrationSet::new(vec![
            m("20230101000000_a"),
            m("20230102000000_b"),
            m("20230103000000_c"),
        ])
        .unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.latest().unwrap().id.name(), "c");
        assert!(set.get(&MigrationId::parse("20230102000000_b").unwrap()).is_some());
        assert!(set.get(&MigrationId::parse("20230102000000_z").unwrap()).is_none());
    }

    #[test]
    fn timestamp_collision_is_rejected() {
        let err = MigrationSet::new(vec![m("20230101000000_a"), m("20230101000000_b")]).unwrap_err();
        match err {
            Error::OrderingConflict { kind, first, second } => {
                assert_eq!(kind, ConflictKind::Collision);
                assert_eq!(first, "20230101000000_a");
                assert_eq!(second, "20230101000000_b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_monotonic_declaration_is_rejected() {
        let err = MigrationSet::new(vec![m("20230102000000_b"), m("20230101000000_a")]).unwrap_err();
        assert!(matches!(
            err,
            Error::OrderingConflict {
                kind: ConflictKind::NonMonotonic,
                ..
            }
        ));
    }

    #[test]
    fn merging_sources_interleaves_and_detects_cross_source_collisions() {
        let set = MigrationSet::from_sources(vec![
            vec![m("20230101000000_a"), m("20230103000000_c")],
            vec![m("20230102000000_b")],
        ])
        .unwrap();
        let names: Vec<_> = set.iter().map(|m| m.id.name().to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let err = MigrationSet::from_sources(vec![
            vec![m("20230101000000_a")],
            vec![m("20230101000000_other")],
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            Error::OrderingConflict {
                kind: ConflictKind::Collision,
                ..
            }
        ));
    }
}
