use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tidemark_common::{Error, MigrationKey, Result};
use tracing::{debug, info, warn};

use crate::graph::MigrationGraph;
use crate::ledger::Ledger;
use crate::migrations::{Migration, Operation};
use crate::schema::{SchemaEditor, quote_ident};
use crate::state::ProjectState;

/// Brings a SQLite database in line with a migration graph.
///
/// Each migration runs in its own `IMMEDIATE` transaction together with its
/// ledger record, so it is either fully applied and recorded or not at all.
pub struct Applier {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Stop after this migration and its dependencies.
    pub target: Option<MigrationKey>,
    /// Record migrations as applied without touching the schema.
    pub fake: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrateReport {
    pub applied: Vec<MigrationKey>,
    pub faked: bool,
}

/// One row of `showmigrations`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub key: MigrationKey,
    pub applied_at: Option<DateTime<Utc>>,
}

impl Applier {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        Ledger::new(&conn).ensure_table()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// How long to wait for another writer before failing.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.connection()?
            .busy_timeout(timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("applier lock poisoned".into()))
    }

    /// Run `f` against the underlying connection, e.g. to read or write rows.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.connection()?;
        f(&conn).map_err(|e| Error::Database(e.to_string()))
    }

    pub fn applied(&self) -> Result<BTreeMap<MigrationKey, DateTime<Utc>>> {
        let conn = self.connection()?;
        Ledger::new(&conn).applied()
    }

    fn applied_keys(&self, graph: &MigrationGraph) -> Result<BTreeSet<MigrationKey>> {
        let applied: BTreeSet<MigrationKey> = self.applied()?.into_keys().collect();
        for unknown in applied.iter().filter(|k| !graph.contains(k)) {
            warn!("ledger lists {unknown}, which has no definition");
        }
        Ok(applied)
    }

    /// Pending migrations in the order `migrate` would apply them.
    pub fn plan<'g>(
        &self,
        graph: &'g MigrationGraph,
        target: Option<&MigrationKey>,
    ) -> Result<Vec<&'g Migration>> {
        let applied = self.applied_keys(graph)?;
        graph.plan(&applied, target)
    }

    /// Apply every pending migration, stopping at the first failure.
    /// Migrations applied before the failure stay applied.
    pub fn migrate(&self, graph: &MigrationGraph, options: &MigrateOptions) -> Result<MigrateReport> {
        let applied = self.applied_keys(graph)?;
        let plan = graph.plan(&applied, options.target.as_ref())?;
        let mut report = MigrateReport {
            applied: Vec::new(),
            faked: options.fake,
        };
        if plan.is_empty() {
            info!("no migrations to apply");
            return Ok(report);
        }

        let mut state = graph.state_for(&applied)?;
        for migration in plan {
            if options.fake {
                info!("faking {}", migration.key);
            } else {
                info!("applying {}", migration.key);
            }
            if let Err(e) = self.run(&mut state, migration, options.fake) {
                warn!("stopping after {} applied migrations: {e}", report.applied.len());
                return Err(e);
            }
            report.applied.push(migration.key.clone());
        }
        Ok(report)
    }

    /// Execute one migration's operations in order against the schema and
    /// record it. `state` must reflect every migration applied so far; it is
    /// advanced only if the migration commits.
    pub fn apply(&self, state: &mut ProjectState, migration: &Migration) -> Result<()> {
        self.run(state, migration, false)
    }

    /// Record a migration as applied without issuing any DDL.
    pub fn fake(&self, state: &mut ProjectState, migration: &Migration) -> Result<()> {
        self.run(state, migration, true)
    }

    fn run(&self, state: &mut ProjectState, migration: &Migration, fake: bool) -> Result<()> {
        migration.validate()?;
        let mut conn = self.connection()?;

        // foreign_keys cannot change inside a transaction, and a table
        // rebuild with enforcement on would cascade the DROP into children.
        conn.execute_batch("PRAGMA foreign_keys=OFF;")
            .map_err(|e| Error::Database(format!("failed to disable foreign keys: {e}")))?;
        let result = run_in_transaction(&mut conn, state, migration, fake);
        let restored = conn
            .execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to re-enable foreign keys: {e}")));

        let next = result?;
        restored?;
        *state = next;
        Ok(())
    }

    /// Every known migration with its application time, grouped by app.
    pub fn show(&self, graph: &MigrationGraph) -> Result<Vec<MigrationStatus>> {
        let applied = self.applied()?;
        let mut rows: Vec<MigrationStatus> = graph
            .ordered()?
            .into_iter()
            .map(|m| MigrationStatus {
                key: m.key.clone(),
                applied_at: applied.get(&m.key).copied(),
            })
            .collect();
        rows.sort_by(|a, b| a.key.app.cmp(&b.key.app));
        Ok(rows)
    }
}

fn run_in_transaction(
    conn: &mut Connection,
    state: &ProjectState,
    migration: &Migration,
    fake: bool,
) -> Result<ProjectState> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

    let applied = Ledger::new(&tx).applied()?;
    if applied.contains_key(&migration.key) {
        debug!("{} is already applied", migration.key);
        return Ok(state.clone());
    }
    check_dependencies_applied(migration, &applied)?;

    let app = migration.app();
    let mut working = state.clone();
    for operation in &migration.operations {
        let before = working.clone();
        working
            .apply(app, operation)
            .map_err(|reason| operation_error(migration, operation, reason))?;
        if fake {
            continue;
        }

        debug!("{}: {}", migration.key, operation.describe());
        for sql in SchemaEditor::operation_sql(app, operation, &before, &working) {
            debug!("executing: {sql}");
            tx.execute_batch(&sql)
                .map_err(|e| operation_error(migration, operation, e.to_string()))?;
        }
        check_foreign_keys(&tx, &SchemaEditor::affected_table(app, operation))
            .map_err(|reason| operation_error(migration, operation, reason))?;
    }

    Ledger::new(&tx).record(&migration.key)?;
    tx.commit()
        .map_err(|e| Error::Database(format!("failed to commit {}: {e}", migration.key)))?;
    Ok(working)
}

/// Every dependency must already be in the ledger. An `app.__first__`
/// dependency is met by any applied migration of that app.
fn check_dependencies_applied(
    migration: &Migration,
    applied: &BTreeMap<MigrationKey, DateTime<Utc>>,
) -> Result<()> {
    for dependency in migration.dependency_keys()? {
        let met = if dependency.is_first_placeholder() {
            applied.keys().any(|key| key.app == dependency.app)
        } else {
            applied.contains_key(&dependency)
        };
        if !met {
            return Err(Error::UnappliedDependency {
                migration: migration.key.clone(),
                dependency,
            });
        }
    }
    Ok(())
}

fn operation_error(migration: &Migration, operation: &Operation, reason: String) -> Error {
    Error::Operation {
        migration: migration.key.clone(),
        model: operation.model().to_string(),
        field: operation.field().to_string(),
        reason,
    }
}

fn check_foreign_keys(conn: &Connection, table: &str) -> std::result::Result<(), String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA foreign_key_check({})", quote_ident(table)))
        .map_err(|e| e.to_string())?;
    let mut rows = stmt.query([]).map_err(|e| e.to_string())?;
    match rows.next().map_err(|e| e.to_string())? {
        Some(row) => {
            let rowid: Option<i64> = row.get(1).map_err(|e| e.to_string())?;
            let parent: String = row.get(2).map_err(|e| e.to_string())?;
            Err(format!(
                "foreign key violation: row {} of {table} references a missing {parent} row",
                rowid.map(|r| r.to_string()).unwrap_or_else(|| "?".into())
            ))
        }
        None => Ok(()),
    }
}

/// Statements applying `key` would issue, rendered against the schema its
/// dependencies produce. Nothing is executed.
pub fn sql_for(graph: &MigrationGraph, key: &MigrationKey) -> Result<Vec<String>> {
    let migration = graph
        .get(key)
        .ok_or_else(|| Error::NotFound(format!("migration {key}")))?;
    migration.validate()?;

    let app = migration.app();
    let mut state = graph.state_before(key)?;
    let mut statements = Vec::new();
    for operation in &migration.operations {
        let before = state.clone();
        state
            .apply(app, operation)
            .map_err(|reason| operation_error(migration, operation, reason))?;
        statements.push(format!("-- {}", operation.describe()));
        statements.extend(SchemaEditor::operation_sql(app, operation, &before, &state));
    }
    Ok(statements)
}
