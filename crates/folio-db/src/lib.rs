pub mod cancel;
pub mod catalog;
pub mod database;
pub mod ledger;
pub mod migration;
pub mod runner;
pub mod source;

pub use cancel::CancelToken;
pub use database::{Database, SchemaObject};
pub use ledger::{Ledger, MigrationRecord};
pub use migration::{Migration, MigrationSet};
pub use runner::{
    MigrationReport, MigrationState, MigrationStatus, Migrator, MigratorOptions, RollbackOptions,
    RollbackReport, RollbackTarget,
};
