use folio_db::{
    Database, Ledger, Migration, MigrationSet, Migrator, MigratorOptions, RollbackOptions,
    RollbackTarget,
};
use proptest::prelude::*;

/// `count` migrations one day apart, each creating its own table.
fn sequence(count: usize) -> Vec<Migration> {
    (0..count)
        .map(|i| {
            let id = format!("2023{:02}{:02}000000_step_{i}", 1 + i / 28, 1 + i % 28);
            Migration::new(
                &id,
                format!("CREATE TABLE t{i} (id INTEGER PRIMARY KEY);"),
                format!("DROP TABLE t{i};"),
            )
            .unwrap()
        })
        .collect()
}

fn migrator(migrations: Vec<Migration>) -> Migrator {
    Migrator::new(
        Database::in_memory(&[]).unwrap(),
        MigrationSet::new(migrations).unwrap(),
        Ledger::new("folio_migrations").unwrap(),
        MigratorOptions::default(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn ledger_is_strictly_increasing_and_latest_is_idempotent(
        count in 1usize..40,
        ups in 0usize..40,
    ) {
        let migrator = migrator(sequence(count));
        for _ in 0..ups.min(count) {
            migrator.migrate_up().unwrap();
        }
        migrator.migrate_latest().unwrap();

        let records = migrator.applied().unwrap();
        prop_assert_eq!(records.len(), count);
        prop_assert!(records.windows(2).all(|w| w[0].identifier < w[1].identifier));
        prop_assert!(records.windows(2).all(|w| w[0].batch <= w[1].batch));

        let again = migrator.migrate_latest().unwrap();
        prop_assert!(again.applied.is_empty());
        prop_assert!(migrator.pending().unwrap().is_empty());
    }

    #[test]
    fn rollback_to_any_applied_target_keeps_a_prefix(count in 2usize..30, pick in 0usize..30) {
        let migrations = sequence(count);
        let target = migrations[pick % count].id.clone();
        let migrator = migrator(migrations);
        migrator.migrate_latest().unwrap();

        let report = migrator
            .rollback(&RollbackTarget::To(target.clone()), RollbackOptions::default())
            .unwrap();
        prop_assert_eq!(report.reverted.len(), count - 1 - pick % count);
        prop_assert!(report.reverted.windows(2).all(|w| w[0] > w[1]));

        let records = migrator.applied().unwrap();
        prop_assert_eq!(records.last().map(|r| &r.identifier), Some(&target));
    }
}
