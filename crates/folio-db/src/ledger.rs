use chrono::{DateTime, Utc};
use folio_common::{Error, MigrationId, Result, is_sql_identifier};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

/// One applied migration as recorded in the ledger table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub identifier: MigrationId,
    pub batch: i64,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
}

/// The persisted list of applied migrations. Every method takes the
/// connection (or an open transaction) so ledger writes commit together
/// with the migration they describe.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Ledger {
    pub fn new(table: &str) -> Result<Self> {
        if !is_sql_identifier(table) {
            return Err(Error::Config(format!("invalid ledger table name: {table:?}")));
        }
        Ok(Self {
            table: table.to_string(),
        })
    }

    pub fn ensure(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS main.{} (
                identifier TEXT PRIMARY KEY,
                batch INTEGER NOT NULL,
                applied_at TEXT NOT NULL,
                checksum TEXT NOT NULL
            );",
            self.table
        ))
        .map_err(|e| Error::Database(format!("failed to create ledger table: {e}")))
    }

    /// Applied migrations in identifier order, which is also the order they
    /// were applied in.
    pub fn records(&self, conn: &Connection) -> Result<Vec<MigrationRecord>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT identifier, batch, applied_at, checksum FROM main.{} ORDER BY identifier ASC",
                self.table
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let (identifier, batch, applied_at, checksum) =
                row.map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))?;
            let identifier = MigrationId::parse(&identifier).map_err(|e| {
                Error::Database(format!("ledger holds a malformed identifier: {e}"))
            })?;
            records.push(MigrationRecord {
                identifier,
                batch,
                applied_at: parse_datetime(&applied_at),
                checksum,
            });
        }
        Ok(records)
    }

    /// Highest batch number recorded, 0 for an empty ledger.
    pub fn latest_batch(&self, conn: &Connection) -> Result<i64> {
        conn.query_row(
            &format!("SELECT COALESCE(MAX(batch), 0) FROM main.{}", self.table),
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to read latest batch: {e}")))
    }

    pub fn insert(
        &self,
        conn: &Connection,
        identifier: &MigrationId,
        batch: i64,
        checksum: &str,
    ) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO main.{} (identifier, batch, applied_at, checksum) VALUES (?1, ?2, ?3, ?4)",
                self.table
            ),
            params![identifier.as_str(), batch, Utc::now().to_rfc3339(), checksum],
        )
        .map_err(|e| Error::Database(format!("failed to record {identifier}: {e}")))?;
        Ok(())
    }

    pub fn remove(&self, conn: &Connection, identifier: &MigrationId) -> Result<()> {
        let removed = conn
            .execute(
                &format!("DELETE FROM main.{} WHERE identifier = ?1", self.table),
                params![identifier.as_str()],
            )
            .map_err(|e| Error::Database(format!("failed to remove {identifier}: {e}")))?;
        if removed == 0 {
            return Err(Error::NotFound(format!("{identifier} is not in the ledger")));
        }
        Ok(())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // Rows written by hand with datetime('now') use "YYYY-MM-DD HH:MM:SS".
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or_default()
        })
}
