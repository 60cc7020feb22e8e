use std::path::{Path, PathBuf};

use tidemark_common::{Error, Result};

use crate::model::AppConfig;

const CANDIDATES: &[&str] = &["tidemark.yml", "tidemark.yaml", "tidemark.toml"];

/// Locates and parses the configuration file, then layers environment
/// overrides on top.
#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    search_dir: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit config file. It must exist.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Directory searched for `tidemark.{yml,yaml,toml}` when no explicit
    /// path is given. Defaults to the working directory.
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dir = Some(dir.into());
        self
    }

    pub fn load(&self) -> Result<AppConfig> {
        self.load_with_source().map(|(config, _)| config)
    }

    /// Load the config and report which file it came from, if any. Nothing is
    /// logged here since this runs before the subscriber is installed.
    pub fn load_with_source(&self) -> Result<(AppConfig, Option<PathBuf>)> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();

        let source = self.locate()?;
        let mut config = match &source {
            Some(path) => {
                let mut config = parse_config(path)?;
                let base = path.parent().unwrap_or(Path::new("."));
                config.resolve_paths(base);
                config
            }
            None => AppConfig::default(),
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok((config, source))
    }

    fn locate(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.path {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }

        let dir = match &self.search_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        Ok(CANDIDATES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file()))
    }
}

/// Parse a config file, picking the format from its extension.
pub fn parse_config(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display()))),
        "toml" => toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display()))),
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}

/// Apply `TIDEMARK_*` overrides. `lookup` is `std::env::var` outside tests.
pub fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(path) = lookup("TIDEMARK_DATABASE").filter(|v| !v.is_empty()) {
        config.database.path = PathBuf::from(path);
    }
    if let Some(dirs) = lookup("TIDEMARK_MIGRATIONS").filter(|v| !v.is_empty()) {
        config.migrations.dirs = std::env::split_paths(&dirs).collect();
    }
    if let Some(level) = lookup("TIDEMARK_LOG").filter(|v| !v.is_empty()) {
        config.log.level = level;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn parses_yaml_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tidemark.yml"),
            "database:\n  path: data/app.sqlite3\nmigrations:\n  dirs: [schema]\n",
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_search_dir(dir.path())
            .load()
            .unwrap();
        assert_eq!(config.database.path, dir.path().join("data/app.sqlite3"));
        assert_eq!(config.migrations.dirs, vec![dir.path().join("schema")]);
    }

    #[test]
    fn parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidemark.toml");
        std::fs::write(
            &path,
            "[log]\nlevel = \"debug\"\n\n[swappable]\nAUTH_USER_MODEL = \"accounts.member\"\n",
        )
        .unwrap();

        let config = parse_config(&path).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(
            config.swappable.get("AUTH_USER_MODEL").map(String::as_str),
            Some("accounts.member")
        );
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../tidemark.yml");
        assert_eq!(parse_config(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn load_reports_the_file_it_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidemark.toml");
        std::fs::write(&path, "[log]\nlevel = \"debug\"\n").unwrap();

        let (_, source) = ConfigLoader::new()
            .with_search_dir(dir.path())
            .load_with_source()
            .unwrap();
        assert_eq!(source, Some(path));

        let empty = tempfile::tempdir().unwrap();
        let (config, source) = ConfigLoader::new()
            .with_search_dir(empty.path())
            .load_with_source()
            .unwrap();
        assert_eq!(source, None);
        assert_eq!(config.swappable, AppConfig::default().swappable);
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new()
            .with_path(dir.path().join("nope.yml"))
            .load()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tidemark.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(parse_config(&path).is_err());
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = [
            ("TIDEMARK_DATABASE", "/tmp/other.sqlite3"),
            ("TIDEMARK_LOG", "trace"),
            ("TIDEMARK_MIGRATIONS", ""),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.database.path, PathBuf::from("/tmp/other.sqlite3"));
        assert_eq!(config.log.level, "trace");
        // Empty values are ignored.
        assert_eq!(config.migrations.dirs, vec![PathBuf::from("migrations")]);
    }
}
