pub mod loader;
pub mod model;

pub use loader::{ConfigLoader, apply_env};
pub use model::{AppConfig, DatabaseConfig, LogConfig, MigrationsConfig};
