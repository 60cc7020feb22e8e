use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tidemark_common::{Error, MigrationKey, Result};

pub const LEDGER_TABLE: &str = "tidemark_migrations";

/// A persisted applied-migration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub key: MigrationKey,
    pub applied_at: DateTime<Utc>,
}

/// Reads and writes the applied-migration ledger through a borrowed
/// connection, so writes can join the caller's transaction.
pub struct Ledger<'c> {
    conn: &'c Connection,
}

impl<'c> Ledger<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn ensure_table(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    app TEXT NOT NULL,
                    name TEXT NOT NULL,
                    applied TEXT NOT NULL,
                    UNIQUE (app, name)
                );"
            ))
            .map_err(|e| Error::Database(format!("failed to create migration ledger: {e}")))
    }

    /// Applied migrations in the order they were recorded.
    pub fn records(&self) -> Result<Vec<AppliedMigration>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT app, name, applied FROM {LEDGER_TABLE} ORDER BY id ASC"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    MigrationKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| Error::Database(format!("failed to query migration ledger: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let (key, applied) =
                row.map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))?;
            let applied_at = parse_datetime(&applied).ok_or_else(|| {
                Error::Database(format!("ledger entry {key} has unreadable timestamp '{applied}'"))
            })?;
            records.push(AppliedMigration { key, applied_at });
        }
        Ok(records)
    }

    pub fn applied(&self) -> Result<BTreeMap<MigrationKey, DateTime<Utc>>> {
        Ok(self
            .records()?
            .into_iter()
            .map(|r| (r.key, r.applied_at))
            .collect())
    }

    pub fn record(&self, key: &MigrationKey) -> Result<AppliedMigration> {
        let applied_at = Utc::now();
        self.conn
            .execute(
                &format!("INSERT INTO {LEDGER_TABLE} (app, name, applied) VALUES (?1, ?2, ?3)"),
                params![key.app, key.name, applied_at.to_rfc3339()],
            )
            .map_err(|e| Error::Database(format!("failed to record migration {key}: {e}")))?;
        Ok(AppliedMigration {
            key: key.clone(),
            applied_at,
        })
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Rows written by hand with datetime('now') use "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .ok()
}
