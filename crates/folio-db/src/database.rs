use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use folio_common::{Error, Result, is_sql_identifier};
use folio_config::DatabaseConfig;
use rusqlite::{Connection, InterruptHandle};
use serde::Serialize;
use tracing::{debug, info};

/// Handle to the site database: the main file plus one attached database
/// per schema namespace, so DDL addresses tables as `identity.users`.
pub struct Database {
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
    namespaces: Vec<String>,
}

/// Structural description of one table or index, used to compare schema
/// state before and after a migration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SchemaObject {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    /// `name type notnull default pk` per column, in declaration order.
    pub columns: Vec<String>,
}

impl Database {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let conn = if config.is_in_memory() {
            Connection::open_in_memory()
                .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?
        } else {
            if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            info!("opening database at {}", config.path.display());
            Connection::open(&config.path)
                .map_err(|e| Error::Database(format!("failed to open database: {e}")))?
        };

        // Rollback journal (not WAL) keeps commits spanning several
        // attached namespaces atomic.
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;

        for ns in &config.namespaces {
            let target = if config.is_in_memory() {
                ":memory:".to_string()
            } else {
                namespace_path(&config.path, ns).to_string_lossy().into_owned()
            };
            attach(&conn, ns, &target)?;
        }

        let interrupt = conn.get_interrupt_handle();
        Ok(Self {
            conn: Mutex::new(conn),
            interrupt,
            namespaces: config.namespaces.clone(),
        })
    }

    /// In-memory database with the given namespaces attached.
    pub fn in_memory(namespaces: &[&str]) -> Result<Self> {
        Self::open(&DatabaseConfig {
            path: PathBuf::from(":memory:"),
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("database lock poisoned".into()))
    }

    /// Abort the statement currently running on this connection, if any.
    /// Its transaction then rolls back.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// Run a script outside the migration system. Meant for seeding data and
    /// for tests; schema changes belong in migrations.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(sql)
            .map_err(|e| Error::Database(format!("script failed: {e}")))
    }

    pub fn table_exists(&self, namespace: &str, table: &str) -> Result<bool> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT count(*) > 0 FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
            checked_namespace(namespace)?
        );
        conn.query_row(&sql, [table], |row| row.get(0))
            .map_err(|e| Error::Database(format!("failed to inspect schema: {e}")))
    }

    pub fn row_count(&self, namespace: &str, table: &str) -> Result<i64> {
        if !is_sql_identifier(table) {
            return Err(Error::Database(format!("invalid table name: {table:?}")));
        }
        let conn = self.connection()?;
        let sql = format!(
            "SELECT COUNT(*) FROM {}.{table}",
            checked_namespace(namespace)?
        );
        conn.query_row(&sql, [], |row| row.get(0))
            .map_err(|e| Error::Database(format!("failed to count rows: {e}")))
    }

    /// Every table and index across `main` and the attached namespaces,
    /// sorted. SQLite's internal objects are left out.
    pub fn schema_snapshot(&self) -> Result<Vec<SchemaObject>> {
        let conn = self.connection()?;
        let mut objects = Vec::new();

        let schemas = std::iter::once("main".to_string()).chain(self.namespaces.iter().cloned());
        for schema in schemas {
            let sql = format!(
                "SELECT type, name FROM {schema}.sqlite_master
                 WHERE type IN ('table', 'index') AND name NOT LIKE 'sqlite_%'
                 ORDER BY type, name"
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
            let entries = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(|e| Error::Database(format!("failed to read schema: {e}")))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::Database(format!("failed to read schema row: {e}")))?;

            for (kind, name) in entries {
                let columns = if kind == "table" {
                    table_columns(&conn, &schema, &name)?
                } else {
                    Vec::new()
                };
                objects.push(SchemaObject {
                    namespace: schema.clone(),
                    kind,
                    name,
                    columns,
                });
            }
        }

        objects.sort();
        Ok(objects)
    }
}

/// `site.db` + `crm` -> `site.crm.db` in the same directory.
pub fn namespace_path(main: &Path, namespace: &str) -> PathBuf {
    let stem = main
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "folio".to_string());
    main.with_file_name(format!("{stem}.{namespace}.db"))
}

fn attach(conn: &Connection, namespace: &str, target: &str) -> Result<()> {
    let sql = format!("ATTACH DATABASE ?1 AS {}", checked_namespace(namespace)?);
    conn.execute(&sql, [target])
        .map_err(|e| Error::Database(format!("failed to attach namespace {namespace}: {e}")))?;
    debug!(namespace, target, "attached namespace");
    Ok(())
}

fn checked_namespace(namespace: &str) -> Result<&str> {
    if is_sql_identifier(namespace) {
        Ok(namespace)
    } else {
        Err(Error::Database(format!("invalid namespace: {namespace:?}")))
    }
}

fn table_columns(conn: &Connection, schema: &str, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1, ?2)")
        .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
    stmt.query_map([table, schema], |row| {
        Ok(format!(
            "{} {} {} {} {}",
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Option<String>>(3)?.unwrap_or_else(|| "NULL".into()),
            row.get::<_, i64>(4)?,
        ))
    })
    .map_err(|e| Error::Database(format!("failed to read columns of {schema}.{table}: {e}")))?
    .collect::<rusqlite::Result<Vec<_>>>()
    .map_err(|e| Error::Database(format!("failed to read column row: {e}")))
}
