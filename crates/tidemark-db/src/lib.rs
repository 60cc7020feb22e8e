pub mod applier;
pub mod definitions;
pub mod graph;
pub mod ledger;
pub mod migrations;
pub mod schema;
pub mod state;

pub use applier::{Applier, MigrateOptions, MigrateReport, MigrationStatus, sql_for};
pub use definitions::DefinitionLoader;
pub use graph::{MigrationGraph, plan};
pub use ledger::{AppliedMigration, LEDGER_TABLE, Ledger};
pub use migrations::{
    Choice, DefaultValue, Dependency, FieldDef, FieldKind, FieldShape, Migration, ModelRef,
    OnDelete, Operation,
};
pub use schema::SchemaEditor;
pub use state::{ModelState, ProjectState};
