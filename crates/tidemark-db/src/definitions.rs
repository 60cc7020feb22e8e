//! Loads migration definitions from `<dir>/<app>/<name>.yml` files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tidemark_common::{Error, MigrationKey, Result};
use tracing::{debug, info};

use crate::migrations::{Dependency, Migration, Operation};

/// On-disk shape of one migration. The identity comes from the path.
#[derive(Debug, Deserialize)]
struct MigrationFile {
    #[serde(default)]
    dependencies: Vec<Dependency>,
    #[serde(default)]
    operations: Vec<Operation>,
    #[serde(default = "default_atomic")]
    atomic: bool,
}

fn default_atomic() -> bool {
    true
}

/// Reads migration files and resolves swappable references.
pub struct DefinitionLoader<'a> {
    swappable: &'a BTreeMap<String, String>,
}

impl<'a> DefinitionLoader<'a> {
    pub fn new(swappable: &'a BTreeMap<String, String>) -> Self {
        Self { swappable }
    }

    /// Load every migration under each of `dirs`. An identity defined in
    /// more than one place is an error.
    pub fn load_dirs(&self, dirs: &[PathBuf]) -> Result<Vec<Migration>> {
        let mut seen: BTreeMap<MigrationKey, PathBuf> = BTreeMap::new();
        let mut migrations = Vec::new();

        for dir in dirs {
            for (path, migration) in self.load_dir(dir)? {
                if let Some(previous) = seen.insert(migration.key.clone(), path.clone()) {
                    return Err(Error::InvalidMigration {
                        migration: migration.key,
                        reason: format!(
                            "defined in both {} and {}",
                            previous.display(),
                            path.display()
                        ),
                    });
                }
                migrations.push(migration);
            }
        }

        info!("loaded {} migration definitions", migrations.len());
        Ok(migrations)
    }

    fn load_dir(&self, dir: &Path) -> Result<Vec<(PathBuf, Migration)>> {
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "migrations directory not found: {}",
                dir.display()
            )));
        }

        let mut loaded = Vec::new();
        for app_dir in sorted_entries(dir)? {
            if !app_dir.is_dir() {
                continue;
            }
            let Some(app) = app_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            for path in sorted_entries(&app_dir)? {
                let is_yaml = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "yml" || e == "yaml");
                let Some(name) = path.file_stem().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !is_yaml || name.starts_with('.') {
                    continue;
                }
                let contents = std::fs::read_to_string(&path)?;
                let migration = self.parse(app, name, &contents)?;
                debug!("loaded {} from {}", migration.key, path.display());
                loaded.push((path.clone(), migration));
            }
        }
        Ok(loaded)
    }

    /// Parse one YAML definition for `app.name`.
    pub fn parse(&self, app: &str, name: &str, contents: &str) -> Result<Migration> {
        let key = MigrationKey::new(app, name);
        let file: MigrationFile =
            serde_yaml::from_str(contents).map_err(|e| Error::InvalidMigration {
                migration: key.clone(),
                reason: format!("YAML parse error: {e}"),
            })?;

        let mut migration = Migration {
            key,
            dependencies: file.dependencies,
            operations: file.operations,
            atomic: file.atomic,
        };
        migration.resolve_swappable(self.swappable)?;
        migration.validate()?;
        Ok(migration)
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::{FieldKind, OnDelete};

    fn settings() -> BTreeMap<String, String> {
        [("AUTH_USER_MODEL".to_string(), "auth.user".to_string())]
            .into_iter()
            .collect()
    }

    const INSIGHT_0005: &str = "
dependencies:
  - myapp.0004_insight_updated_at_insight_user_ticket
  - setting: AUTH_USER_MODEL
operations:
  - op: alter_field
    model: insight
    field: session_id
    shape:
      type: char
      max_length: 200
  - op: alter_field
    model: insight
    field: user
    shape:
      type: foreign_key
      to: {setting: AUTH_USER_MODEL}
      on_delete: cascade
";

    #[test]
    fn parse_resolves_dependencies_and_targets() {
        let settings = settings();
        let loader = DefinitionLoader::new(&settings);
        let migration = loader
            .parse("myapp", "0005_alter_insight_session_id_alter_insight_user", INSIGHT_0005)
            .unwrap();

        assert_eq!(
            migration.dependency_keys().unwrap(),
            vec![
                MigrationKey::new("myapp", "0004_insight_updated_at_insight_user_ticket"),
                MigrationKey::first("auth"),
            ]
        );
        assert_eq!(migration.operations.len(), 2);
        match &migration.operations[1] {
            Operation::AlterField { shape, .. } => {
                assert_eq!(
                    shape.kind,
                    FieldKind::ForeignKey {
                        to: "auth.user".into(),
                        on_delete: OnDelete::Cascade
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(migration.atomic);
    }

    #[test]
    fn invalid_shape_is_rejected_at_load() {
        let settings = settings();
        let loader = DefinitionLoader::new(&settings);
        let err = loader
            .parse(
                "myapp",
                "0002",
                "operations:\n  - op: add_field\n    model: llm\n    field: usd\n    shape: {type: decimal, max_digits: 2, decimal_places: 5}\n",
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMigration { .. }));
    }

    #[test]
    fn malformed_yaml_names_the_migration() {
        let settings = settings();
        let loader = DefinitionLoader::new(&settings);
        let err = loader.parse("myapp", "0003", "operations: [").unwrap_err();
        assert!(err.to_string().contains("myapp.0003"));
    }

    #[test]
    fn load_dirs_walks_apps_and_rejects_duplicates() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        for dir in [first.path(), second.path()] {
            std::fs::create_dir_all(dir.join("auth")).unwrap();
        }
        std::fs::write(first.path().join("auth/0001_initial.yml"), "operations: []\n").unwrap();
        std::fs::write(first.path().join("auth/README.md"), "not a migration").unwrap();

        let settings = settings();
        let loader = DefinitionLoader::new(&settings);
        let loaded = loader.load_dirs(&[first.path().to_path_buf()]).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, MigrationKey::new("auth", "0001_initial"));

        std::fs::write(second.path().join("auth/0001_initial.yaml"), "operations: []\n").unwrap();
        let err = loader
            .load_dirs(&[first.path().to_path_buf(), second.path().to_path_buf()])
            .unwrap_err();
        assert!(err.to_string().contains("defined in both"));
    }

    #[test]
    fn missing_directory_is_a_config_error() {
        let settings = settings();
        let loader = DefinitionLoader::new(&settings);
        let err = loader
            .load_dirs(&[PathBuf::from("/definitely/not/here")])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
