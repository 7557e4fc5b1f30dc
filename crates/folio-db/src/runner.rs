use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use folio_common::{ConflictKind, Error, MigrationId, Result, TransactionMode};
use folio_config::{AppConfig, MigrationsConfig};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::catalog;
use crate::database::Database;
use crate::ledger::{Ledger, MigrationRecord};
use crate::migration::{Migration, MigrationSet};
use crate::source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigratorOptions {
    pub transaction_mode: TransactionMode,
    /// Refuse to run when an applied migration's script has changed.
    pub verify_checksums: bool,
}

impl Default for MigratorOptions {
    fn default() -> Self {
        Self {
            transaction_mode: TransactionMode::PerMigration,
            verify_checksums: true,
        }
    }
}

impl From<&MigrationsConfig> for MigratorOptions {
    fn from(config: &MigrationsConfig) -> Self {
        Self {
            transaction_mode: config.transaction_mode,
            verify_checksums: config.verify_checksums,
        }
    }
}

/// Which applied migrations a rollback reverts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    /// Every migration of the highest batch.
    LastBatch,
    /// Only the newest applied migration.
    Last,
    /// Everything newer than the given (still applied) migration.
    To(MigrationId),
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackOptions {
    /// Revert migrations whose down step cannot restore data.
    pub allow_lossy: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    /// `None` when there was nothing to apply.
    pub batch: Option<i64>,
    pub applied: Vec<MigrationId>,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    /// Newest first, in the order they were reverted.
    pub reverted: Vec<MigrationId>,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    Applied {
        batch: i64,
        applied_at: DateTime<Utc>,
    },
    Pending,
    /// Recorded in the ledger but no longer defined.
    Missing {
        batch: i64,
        applied_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub identifier: MigrationId,
    #[serde(flatten)]
    pub state: MigrationState,
    pub lossy: Option<String>,
}

/// Applies and reverts migrations against one database, one at a time, in
/// identifier order.
pub struct Migrator {
    db: Database,
    ledger: Ledger,
    set: MigrationSet,
    options: MigratorOptions,
    cancel: CancelToken,
}

impl Migrator {
    pub fn new(db: Database, set: MigrationSet, ledger: Ledger, options: MigratorOptions) -> Self {
        Self {
            db,
            ledger,
            set,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Load every configured migration source, then open the configured
    /// database. Ordering problems and missing namespaces surface here,
    /// before the database is touched.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        if config.migrations.builtin {
            let missing = catalog::missing_namespaces(&config.database.namespaces);
            if !missing.is_empty() {
                return Err(Error::Config(format!(
                    "built-in migrations need namespaces that are not configured: {}",
                    missing.join(", ")
                )));
            }
        }

        let set = source::load_configured(&config.migrations)?;
        let ledger = Ledger::new(&config.migrations.table)?;
        let db = Database::open(&config.database)?;
        Ok(Self::new(db, set, ledger, (&config.migrations).into()))
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stop after the in-flight statement; its transaction rolls back.
    pub fn interrupt(&self) {
        self.cancel.cancel();
        self.db.interrupt();
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn migrations(&self) -> &MigrationSet {
        &self.set
    }

    pub fn applied(&self) -> Result<Vec<MigrationRecord>> {
        let conn = self.db.connection()?;
        self.ledger.ensure(&conn)?;
        self.ledger.records(&conn)
    }

    /// Migrations `migrate_latest` would apply, in order. Fails the same way
    /// `migrate_latest` would if the ledger and definitions disagree.
    pub fn pending(&self) -> Result<Vec<&Migration>> {
        let records = self.applied()?;
        self.plan(&records)
    }

    /// Every known migration plus any ledger entry without a definition.
    pub fn status(&self) -> Result<Vec<MigrationStatus>> {
        let records = self.applied()?;
        let by_id: HashMap<&MigrationId, &MigrationRecord> =
            records.iter().map(|r| (&r.identifier, r)).collect();

        let mut statuses: Vec<MigrationStatus> = self
            .set
            .iter()
            .map(|m| MigrationStatus {
                identifier: m.id.clone(),
                state: match by_id.get(&m.id) {
                    Some(r) => MigrationState::Applied {
                        batch: r.batch,
                        applied_at: r.applied_at,
                    },
                    None => MigrationState::Pending,
                },
                lossy: m.lossy.clone(),
            })
            .collect();

        statuses.extend(
            records
                .iter()
                .filter(|r| self.set.get(&r.identifier).is_none())
                .map(|r| MigrationStatus {
                    identifier: r.identifier.clone(),
                    state: MigrationState::Missing {
                        batch: r.batch,
                        applied_at: r.applied_at,
                    },
                    lossy: None,
                }),
        );
        statuses.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(statuses)
    }

    /// Apply every pending migration as one new batch.
    pub fn migrate_latest(&self) -> Result<MigrationReport> {
        self.migrate(None)
    }

    /// Apply only the next pending migration, as its own batch.
    pub fn migrate_up(&self) -> Result<MigrationReport> {
        self.migrate(Some(1))
    }

    fn migrate(&self, limit: Option<usize>) -> Result<MigrationReport> {
        let started = Instant::now();
        let mut conn = self.db.connection()?;
        self.ledger.ensure(&conn)?;

        let records = self.ledger.records(&conn)?;
        let mut pending = self.plan(&records)?;
        if let Some(limit) = limit {
            pending.truncate(limit);
        }

        if pending.is_empty() {
            info!("schema is up to date");
            return Ok(MigrationReport {
                elapsed_ms: started.elapsed().as_millis(),
                ..Default::default()
            });
        }

        let batch = self.ledger.latest_batch(&conn)? + 1;
        info!(
            batch,
            count = pending.len(),
            mode = %self.options.transaction_mode,
            "applying migrations"
        );

        let applied = match self.options.transaction_mode {
            TransactionMode::PerMigration => self.apply_each(&mut conn, &pending, batch)?,
            TransactionMode::PerBatch => self.apply_batch(&mut conn, &pending, batch)?,
        };

        Ok(MigrationReport {
            batch: Some(batch),
            applied,
            elapsed_ms: started.elapsed().as_millis(),
        })
    }

    /// Check the ledger against the definitions and compute the pending
    /// list. Nothing is executed.
    fn plan<'a>(&'a self, records: &[MigrationRecord]) -> Result<Vec<&'a Migration>> {
        for record in records {
            let migration = self.set.get(&record.identifier).ok_or_else(|| {
                Error::LedgerDivergence {
                    identifier: record.identifier.to_string(),
                }
            })?;

            if self.options.verify_checksums {
                let current = migration.checksum();
                if current != record.checksum {
                    return Err(Error::ChecksumMismatch {
                        identifier: record.identifier.to_string(),
                        recorded: record.checksum.clone(),
                        current,
                    });
                }
            }
        }

        let applied: HashSet<&MigrationId> = records.iter().map(|r| &r.identifier).collect();
        let pending: Vec<&Migration> = self
            .set
            .iter()
            .filter(|m| !applied.contains(&m.id))
            .collect();

        // Records are sorted, so the last one is the newest applied.
        if let (Some(newest), Some(first)) = (records.last(), pending.first())
            && first.id < newest.identifier
        {
            return Err(Error::OrderingConflict {
                kind: ConflictKind::OutOfOrder,
                first: newest.identifier.to_string(),
                second: first.id.to_string(),
            });
        }

        Ok(pending)
    }

    fn apply_each(
        &self,
        conn: &mut Connection,
        pending: &[&Migration],
        batch: i64,
    ) -> Result<Vec<MigrationId>> {
        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            self.check_cancelled(&applied)?;

            if let Err(message) = self.apply_step(conn, migration, batch) {
                error!(identifier = %migration.id, "migration failed, transaction rolled back: {message}");
                return Err(self.cancelled_or(&applied, Error::ApplyFailure {
                    identifier: migration.id.to_string(),
                    message,
                }));
            }

            info!(identifier = %migration.id, batch, "applied migration");
            applied.push(migration.id.clone());
        }
        Ok(applied)
    }

    fn apply_step(
        &self,
        conn: &mut Connection,
        migration: &Migration,
        batch: i64,
    ) -> std::result::Result<(), String> {
        // Dropping the transaction without commit rolls it back.
        let tx = conn.transaction().map_err(|e| e.to_string())?;
        run_script(&tx, &migration.up)?;
        self.ledger
            .insert(&tx, &migration.id, batch, &migration.checksum())
            .map_err(|e| e.to_string())?;
        tx.commit().map_err(|e| e.to_string())
    }

    fn apply_batch(
        &self,
        conn: &mut Connection,
        pending: &[&Migration],
        batch: i64,
    ) -> Result<Vec<MigrationId>> {
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        for migration in pending {
            self.check_cancelled(&[])?;

            let staged = run_script(&tx, &migration.up).and_then(|_| {
                self.ledger
                    .insert(&tx, &migration.id, batch, &migration.checksum())
                    .map_err(|e| e.to_string())
            });
            if let Err(message) = staged {
                error!(identifier = %migration.id, batch, "migration failed, batch rolled back: {message}");
                return Err(self.cancelled_or(&[], Error::ApplyFailure {
                    identifier: migration.id.to_string(),
                    message: format!("{message} (whole batch rolled back)"),
                }));
            }
        }

        let last = pending.last().map(|m| m.id.to_string()).unwrap_or_default();
        tx.commit().map_err(|e| Error::ApplyFailure {
            identifier: last,
            message: format!("batch commit failed: {e}"),
        })?;

        let applied: Vec<MigrationId> = pending.iter().map(|m| m.id.clone()).collect();
        for id in &applied {
            info!(identifier = %id, batch, "applied migration");
        }
        Ok(applied)
    }

    /// Revert applied migrations, newest first, one transaction each.
    pub fn rollback(
        &self,
        target: &RollbackTarget,
        options: RollbackOptions,
    ) -> Result<RollbackReport> {
        let started = Instant::now();
        let mut conn = self.db.connection()?;
        self.ledger.ensure(&conn)?;
        let records = self.ledger.records(&conn)?;

        let plan: Vec<&MigrationRecord> = match target {
            RollbackTarget::LastBatch => {
                let newest = records.iter().map(|r| r.batch).max();
                records
                    .iter()
                    .filter(|r| Some(r.batch) == newest)
                    .rev()
                    .collect()
            }
            RollbackTarget::Last => records.last().into_iter().collect(),
            RollbackTarget::To(id) => {
                if !records.iter().any(|r| &r.identifier == id) {
                    return Err(Error::NotFound(format!("{id} is not applied")));
                }
                records.iter().filter(|r| r.identifier > *id).rev().collect()
            }
            RollbackTarget::All => records.iter().rev().collect(),
        };

        let steps = plan
            .iter()
            .map(|r| {
                self.set
                    .get(&r.identifier)
                    .ok_or_else(|| Error::LedgerDivergence {
                        identifier: r.identifier.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        if !options.allow_lossy
            && let Some(lossy) = steps.iter().find(|m| m.is_lossy())
        {
            return Err(Error::LossyRollback {
                identifier: lossy.id.to_string(),
                reason: lossy.lossy.clone().unwrap_or_default(),
            });
        }

        if steps.is_empty() {
            info!("nothing to roll back");
        }

        let mut reverted = Vec::with_capacity(steps.len());
        for migration in steps {
            self.check_cancelled(&reverted)?;

            if let Some(reason) = &migration.lossy {
                warn!(identifier = %migration.id, "rolling back lossy migration: {reason}");
            }

            if let Err(message) = self.revert_step(&mut conn, migration) {
                error!(identifier = %migration.id, "rollback failed, transaction rolled back: {message}");
                return Err(self.cancelled_or(&reverted, Error::RollbackFailure {
                    identifier: migration.id.to_string(),
                    reverted: reverted.iter().map(ToString::to_string).collect(),
                    message,
                }));
            }

            info!(identifier = %migration.id, "rolled back migration");
            reverted.push(migration.id.clone());
        }

        Ok(RollbackReport {
            reverted,
            elapsed_ms: started.elapsed().as_millis(),
        })
    }

    fn revert_step(
        &self,
        conn: &mut Connection,
        migration: &Migration,
    ) -> std::result::Result<(), String> {
        let tx = conn.transaction().map_err(|e| e.to_string())?;
        run_script(&tx, &migration.down)?;
        self.ledger
            .remove(&tx, &migration.id)
            .map_err(|e| e.to_string())?;
        tx.commit().map_err(|e| e.to_string())
    }

    fn check_cancelled(&self, completed: &[MigrationId]) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!(completed = completed.len(), "migration run cancelled");
            return Err(cancelled(completed));
        }
        Ok(())
    }

    /// An interrupted statement surfaces as a database error; report it as a
    /// cancellation instead.
    fn cancelled_or(&self, completed: &[MigrationId], err: Error) -> Error {
        if self.cancel.is_cancelled() {
            cancelled(completed)
        } else {
            err
        }
    }
}

/// Run one script inside an open transaction. A script that commits or rolls
/// back on its own would leave partial changes behind, so the step fails.
fn run_script(tx: &Connection, sql: &str) -> std::result::Result<(), String> {
    tx.execute_batch(sql).map_err(|e| e.to_string())?;
    if tx.is_autocommit() {
        return Err("script ended the migration transaction".to_string());
    }
    Ok(())
}

fn cancelled(completed: &[MigrationId]) -> Error {
    Error::Cancelled {
        completed: completed.iter().map(ToString::to_string).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(id: &str, table: &str) -> Migration {
        Migration::new(
            id,
            format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY);"),
            format!("DROP TABLE {table};"),
        )
        .unwrap()
    }

    fn migrator(migrations: Vec<Migration>) -> Migrator {
        Migrator::new(
            Database::in_memory(&[]).unwrap(),
            MigrationSet::new(migrations).unwrap(),
            Ledger::new("folio_migrations").unwrap(),
            MigratorOptions::default(),
        )
    }

    fn ids(list: &[MigrationId]) -> Vec<&str> {
        list.iter().map(|id| id.as_str()).collect()
    }

    #[test]
    fn latest_applies_everything_in_one_batch() {
        let migrator = migrator(vec![m("20230101000000_a", "a"), m("20230102000000_b", "b")]);
        let report = migrator.migrate_latest().unwrap();
        assert_eq!(report.batch, Some(1));
        assert_eq!(ids(&report.applied), ["20230101000000_a", "20230102000000_b"]);

        let again = migrator.migrate_latest().unwrap();
        assert_eq!(again.batch, None);
        assert!(again.applied.is_empty());
        assert!(migrator.pending().unwrap().is_empty());
    }

    #[test]
    fn up_applies_one_at_a_time_in_separate_batches() {
        let migrator = migrator(vec![m("20230101000000_a", "a"), m("20230102000000_b", "b")]);
        assert_eq!(migrator.migrate_up().unwrap().batch, Some(1));
        assert_eq!(migrator.pending().unwrap().len(), 1);
        assert_eq!(migrator.migrate_up().unwrap().batch, Some(2));
        assert_eq!(migrator.migrate_up().unwrap().batch, None);
    }

    #[test]
    fn last_batch_rollback_reverts_newest_batch_only() {
        let migrator = migrator(vec![
            m("20230101000000_a", "a"),
            m("20230102000000_b", "b"),
            m("20230103000000_c", "c"),
        ]);
        migrator.migrate_up().unwrap();
        migrator.migrate_latest().unwrap();

        let report = migrator
            .rollback(&RollbackTarget::LastBatch, RollbackOptions::default())
            .unwrap();
        assert_eq!(ids(&report.reverted), ["20230103000000_c", "20230102000000_b"]);

        let applied = migrator.applied().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].identifier.as_str(), "20230101000000_a");
    }

    #[test]
    fn rollback_to_unknown_target_is_not_found() {
        let migrator = migrator(vec![m("20230101000000_a", "a")]);
        migrator.migrate_latest().unwrap();
        let target = RollbackTarget::To(MigrationId::parse("20230105000000_zzz").unwrap());
        let err = migrator.rollback(&target, RollbackOptions::default()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn rollback_on_empty_ledger_is_a_noop() {
        let migrator = migrator(vec![m("20230101000000_a", "a")]);
        let report = migrator
            .rollback(&RollbackTarget::All, RollbackOptions::default())
            .unwrap();
        assert!(report.reverted.is_empty());
    }

    #[test]
    fn cancelled_token_stops_before_first_migration() {
        let migrator = migrator(vec![m("20230101000000_a", "a")]);
        migrator.cancel_token().cancel();

        match migrator.migrate_latest().unwrap_err() {
            Error::Cancelled { completed } => assert!(completed.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
        assert!(migrator.applied().unwrap().is_empty());
    }

    #[test]
    fn script_that_commits_on_its_own_fails_the_step() {
        // Built directly so the load-time check does not reject it first.
        let committing = Migration {
            id: MigrationId::parse("20230102000000_committing").unwrap(),
            up: "CREATE TABLE half (id INTEGER); COMMIT;".into(),
            down: "DROP TABLE half;".into(),
            lossy: None,
        };
        let migrator = migrator(vec![m("20230101000000_a", "a"), committing]);

        match migrator.migrate_latest().unwrap_err() {
            Error::ApplyFailure { identifier, message } => {
                assert_eq!(identifier, "20230102000000_committing");
                assert!(message.contains("ended the migration transaction"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let applied = migrator.applied().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].identifier.as_str(), "20230101000000_a");
    }

    #[test]
    fn status_marks_applied_pending_and_missing() {
        let first = migrator(vec![m("20230101000000_a", "a"), m("20230102000000_b", "b")]);
        first.migrate_up().unwrap();
        assert_eq!(first.status().unwrap()[1].state, MigrationState::Pending);

        // Same database, definition of `a` gone.
        let Migrator { db, ledger, .. } = first;
        let second = Migrator::new(
            db,
            MigrationSet::new(vec![m("20230102000000_b", "b")]).unwrap(),
            ledger,
            MigratorOptions::default(),
        );
        let status = second.status().unwrap();
        assert_eq!(status.len(), 2);
        assert!(matches!(status[0].state, MigrationState::Missing { batch: 1, .. }));
        assert_eq!(status[1].state, MigrationState::Pending);

        let err = second.migrate_latest().unwrap_err();
        assert!(matches!(err, Error::LedgerDivergence { .. }));
    }

    #[test]
    fn status_serializes_with_flat_state_tag() {
        let migrator = migrator(vec![m("20230101000000_a", "a")]);
        let json = serde_json::to_value(migrator.status().unwrap()).unwrap();
        assert_eq!(json[0]["identifier"], "20230101000000_a");
        assert_eq!(json[0]["state"], "pending");
        assert!(json[0]["lossy"].is_null());
    }
}
