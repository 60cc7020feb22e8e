use thiserror::Error;

use crate::types::MigrationKey;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid migration {migration}: {reason}")]
    InvalidMigration {
        migration: MigrationKey,
        reason: String,
    },

    #[error("dependency cycle between migrations: {}", format_cycle(.0))]
    Cycle(Vec<MigrationKey>),

    #[error("migration {migration} depends on {dependency}, which does not exist")]
    MissingDependency {
        migration: MigrationKey,
        dependency: MigrationKey,
    },

    #[error(
        "migration {migration} is applied before its dependency {dependency}; the ledger is inconsistent"
    )]
    InconsistentHistory {
        migration: MigrationKey,
        dependency: MigrationKey,
    },

    #[error("cannot apply {migration}: its dependency {dependency} is not applied")]
    UnappliedDependency {
        migration: MigrationKey,
        dependency: MigrationKey,
    },

    #[error("migration {migration} failed altering {model}.{field}: {reason}")]
    Operation {
        migration: MigrationKey,
        model: String,
        field: String,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

fn format_cycle(keys: &[MigrationKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::types::MigrationKey;

    #[test]
    fn error_display_includes_context() {
        let e = Error::Config("bad yaml".into());
        assert_eq!(e.to_string(), "configuration error: bad yaml");

        let e = Error::Database("locked".into());
        assert_eq!(e.to_string(), "database error: locked");
    }

    #[test]
    fn operation_error_names_migration_and_target() {
        let e = Error::Operation {
            migration: MigrationKey::new("myapp", "0011_alter_customer"),
            model: "product".into(),
            field: "price".into(),
            reason: "CHECK constraint failed".into(),
        };
        assert_eq!(
            e.to_string(),
            "migration myapp.0011_alter_customer failed altering product.price: CHECK constraint failed"
        );
    }

    #[test]
    fn unapplied_dependency_names_both_migrations() {
        let e = Error::UnappliedDependency {
            migration: MigrationKey::new("shop", "0002_b"),
            dependency: MigrationKey::new("shop", "0001_a"),
        };
        assert_eq!(
            e.to_string(),
            "cannot apply shop.0002_b: its dependency shop.0001_a is not applied"
        );
    }

    #[test]
    fn cycle_error_lists_path() {
        let e = Error::Cycle(vec![
            MigrationKey::new("a", "0001"),
            MigrationKey::new("b", "0001"),
            MigrationKey::new("a", "0001"),
        ]);
        assert_eq!(
            e.to_string(),
            "dependency cycle between migrations: a.0001 -> b.0001 -> a.0001"
        );
    }
}
