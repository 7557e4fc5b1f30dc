pub mod error;
pub mod types;

pub use error::{ConflictKind, Error, Result};
pub use types::{MigrationId, TransactionMode, is_sql_identifier};
