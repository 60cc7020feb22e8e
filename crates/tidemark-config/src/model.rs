use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration, read from `tidemark.yml` or `tidemark.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    /// Swappable model settings, e.g. `AUTH_USER_MODEL: auth.user`.
    /// Migrations may depend on, or point foreign keys at, a setting name
    /// instead of a fixed model.
    pub swappable: BTreeMap<String, String>,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            migrations: MigrationsConfig::default(),
            swappable: [("AUTH_USER_MODEL".to_string(), "auth.user".to_string())]
                .into_iter()
                .collect(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Make relative paths relative to `base` (the config file's directory).
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.database.path.is_relative() {
            self.database.path = base.join(&self.database.path);
        }
        for dir in &mut self.migrations.dirs {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// How long to wait on another writer's lock before giving up.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("db.sqlite3"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    /// Directories laid out as `<dir>/<app>/<name>.yml`.
    pub dirs: Vec<PathBuf>,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dirs: vec![PathBuf::from("migrations")],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_files() {
        let config = AppConfig::default();
        assert_eq!(config.database.path, PathBuf::from("db.sqlite3"));
        assert_eq!(config.migrations.dirs, vec![PathBuf::from("migrations")]);
        assert_eq!(
            config.swappable.get("AUTH_USER_MODEL").map(String::as_str),
            Some("auth.user")
        );
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: AppConfig = serde_yaml::from_str("log:\n  json: true\n").unwrap();
        assert!(config.log.json);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.database, DatabaseConfig::default());
    }

    #[test]
    fn resolve_paths_only_touches_relative_paths() {
        let mut config = AppConfig::default();
        config.migrations.dirs.push(PathBuf::from("/abs/migrations"));
        config.resolve_paths(Path::new("/srv/app"));

        assert_eq!(config.database.path, PathBuf::from("/srv/app/db.sqlite3"));
        assert_eq!(
            config.migrations.dirs,
            vec![
                PathBuf::from("/srv/app/migrations"),
                PathBuf::from("/abs/migrations")
            ]
        );
    }
}
