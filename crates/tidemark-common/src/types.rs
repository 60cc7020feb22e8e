use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Name used in place of a migration name to mean "the root migration of the app".
pub const FIRST_MIGRATION: &str = "__first__";

/// Identity of a migration: the app it belongs to and its sequence name.
///
/// Ordering is `(app, name)`, which is also the tie-break the planner uses
/// between migrations that do not depend on each other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationKey {
    pub app: String,
    pub name: String,
}

impl MigrationKey {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }

    /// Reference to the first migration of `app`, resolved by the planner.
    pub fn first(app: impl Into<String>) -> Self {
        Self::new(app, FIRST_MIGRATION)
    }

    pub fn is_first_placeholder(&self) -> bool {
        self.name == FIRST_MIGRATION
    }
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app, self.name)
    }
}

impl FromStr for MigrationKey {
    type Err = Error;

    /// Parses `app.name`. Migration names may themselves contain dots, so
    /// only the first one separates the app.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((app, name)) if !app.is_empty() && !name.is_empty() => Ok(Self::new(app, name)),
            _ => Err(Error::Config(format!(
                "invalid migration reference '{s}', expected app.name"
            ))),
        }
    }
}

impl TryFrom<String> for MigrationKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MigrationKey> for String {
    fn from(key: MigrationKey) -> Self {
        key.to_string()
    }
}
