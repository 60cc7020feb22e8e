//! Migration records and the declarative operations they carry.
//!
//! A migration is pure data: an identity, the migrations it must follow, and
//! an ordered list of field operations. Nothing here touches the database;
//! [`crate::state`] interprets operations against a schema snapshot and
//! [`crate::schema`] turns them into SQL.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tidemark_common::{Error, MigrationKey, Result};

/// Migration system for tracking and applying database schema changes.
///
/// Each migration has an `(app, name)` identity, a list of dependencies and a
/// list of operations. Migrations are applied in dependency order and tracked
/// in the `tidemark_migrations` ledger table.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    pub key: MigrationKey,
    pub dependencies: Vec<Dependency>,
    pub operations: Vec<Operation>,
    /// Recorded for parity with generated definitions. SQLite migrations are
    /// always applied inside a single transaction.
    pub atomic: bool,
}

impl Migration {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: MigrationKey::new(app, name),
            dependencies: Vec::new(),
            operations: Vec::new(),
            atomic: true,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<Dependency>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn app(&self) -> &str {
        &self.key.app
    }

    /// Replace swappable references (dependencies and foreign-key targets)
    /// with the concrete model they are configured to point at.
    pub fn resolve_swappable(&mut self, settings: &BTreeMap<String, String>) -> Result<()> {
        let lookup = |setting: &str| -> Result<String> {
            settings.get(setting).map(|m| m.to_lowercase()).ok_or_else(|| {
                Error::InvalidMigration {
                    migration: self.key.clone(),
                    reason: format!("unknown swappable setting '{setting}'"),
                }
            })
        };

        let mut dependencies = Vec::with_capacity(self.dependencies.len());
        for dependency in &self.dependencies {
            dependencies.push(match dependency {
                Dependency::Swappable { setting } => {
                    let label = lookup(setting)?;
                    let (app, _) = split_label(&label).ok_or_else(|| Error::InvalidMigration {
                        migration: self.key.clone(),
                        reason: format!("setting '{setting}' is not an app.model label: {label}"),
                    })?;
                    Dependency::Migration(MigrationKey::first(app))
                }
                other => other.clone(),
            });
        }

        let mut operations = self.operations.clone();
        for shape in operations.iter_mut().flat_map(Operation::shapes_mut) {
            if let FieldKind::ForeignKey {
                to: ModelRef::Setting { setting },
                ..
            } = &shape.kind
            {
                let label = lookup(setting)?;
                if let FieldKind::ForeignKey { to, .. } = &mut shape.kind {
                    *to = ModelRef::Model(label);
                }
            }
        }

        self.dependencies = dependencies;
        self.operations = operations;
        Ok(())
    }

    /// Dependencies as migration identities. Fails if a swappable reference
    /// has not been resolved yet.
    pub fn dependency_keys(&self) -> Result<Vec<MigrationKey>> {
        self.dependencies
            .iter()
            .map(|dependency| match dependency {
                Dependency::Migration(key) => Ok(key.clone()),
                Dependency::Swappable { setting } => Err(Error::InvalidMigration {
                    migration: self.key.clone(),
                    reason: format!("unresolved swappable dependency '{setting}'"),
                }),
            })
            .collect()
    }

    /// Check every field shape in isolation. References to other models and
    /// fields are checked later against the project state.
    pub fn validate(&self) -> Result<()> {
        for operation in &self.operations {
            let invalid = |reason: String| Error::InvalidMigration {
                migration: self.key.clone(),
                reason: format!("{}: {reason}", operation.describe()),
            };
            match operation {
                Operation::CreateModel { fields, .. } => {
                    let mut seen = HashSet::new();
                    for field in fields {
                        if !seen.insert(field.name.as_str()) {
                            return Err(invalid(format!("duplicate field '{}'", field.name)));
                        }
                        field
                            .shape
                            .validate()
                            .map_err(|e| invalid(format!("field '{}': {e}", field.name)))?;
                    }
                }
                Operation::AddField { shape, .. } | Operation::AlterField { shape, .. } => {
                    shape.validate().map_err(invalid)?;
                }
            }
        }
        Ok(())
    }
}

/// A prerequisite of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dependency {
    /// Follows the first migration of whatever app the setting names.
    Swappable { setting: String },
    Migration(MigrationKey),
}

impl From<MigrationKey> for Dependency {
    fn from(key: MigrationKey) -> Self {
        Dependency::Migration(key)
    }
}

impl Dependency {
    pub fn swappable(setting: impl Into<String>) -> Self {
        Dependency::Swappable {
            setting: setting.into(),
        }
    }
}

/// One declarative schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateModel {
        model: String,
        fields: Vec<FieldDef>,
    },
    AddField {
        model: String,
        field: String,
        shape: FieldShape,
    },
    AlterField {
        model: String,
        field: String,
        shape: FieldShape,
    },
}

impl Operation {
    pub fn create_model(model: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Operation::CreateModel {
            model: model.into(),
            fields,
        }
    }

    pub fn add_field(model: impl Into<String>, field: impl Into<String>, shape: FieldShape) -> Self {
        Operation::AddField {
            model: model.into(),
            field: field.into(),
            shape,
        }
    }

    pub fn alter_field(
        model: impl Into<String>,
        field: impl Into<String>,
        shape: FieldShape,
    ) -> Self {
        Operation::AlterField {
            model: model.into(),
            field: field.into(),
            shape,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Operation::CreateModel { model, .. }
            | Operation::AddField { model, .. }
            | Operation::AlterField { model, .. } => model,
        }
    }

    /// Target field, or `*` for operations on a whole model.
    pub fn field(&self) -> &str {
        match self {
            Operation::CreateModel { .. } => "*",
            Operation::AddField { field, .. } | Operation::AlterField { field, .. } => field,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Operation::CreateModel { model, .. } => format!("create model {model}"),
            Operation::AddField { model, field, .. } => format!("add field {model}.{field}"),
            Operation::AlterField { model, field, .. } => format!("alter field {model}.{field}"),
        }
    }

    fn shapes_mut(&mut self) -> Vec<&mut FieldShape> {
        match self {
            Operation::CreateModel { fields, .. } => {
                fields.iter_mut().map(|f| &mut f.shape).collect()
            }
            Operation::AddField { shape, .. } | Operation::AlterField { shape, .. } => vec![shape],
        }
    }
}

/// A named field inside a `create_model` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(flatten)]
    pub shape: FieldShape,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, shape: FieldShape) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }
}

/// The complete shape of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldShape {
    #[serde(flatten)]
    pub kind: FieldKind,
    /// Serialized as `nullable`: a bare `null` key is YAML's null scalar.
    #[serde(default, rename = "nullable", skip_serializing_if = "std::ops::Not::not")]
    pub null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
}

impl FieldShape {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            null: false,
            default: None,
            choices: Vec::new(),
        }
    }

    pub fn auto() -> Self {
        Self::new(FieldKind::Auto)
    }

    pub fn integer() -> Self {
        Self::new(FieldKind::Integer)
    }

    pub fn big_integer() -> Self {
        Self::new(FieldKind::BigInteger)
    }

    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    pub fn float() -> Self {
        Self::new(FieldKind::Float)
    }

    pub fn char(max_length: u32) -> Self {
        Self::new(FieldKind::Char { max_length })
    }

    pub fn text() -> Self {
        Self::new(FieldKind::Text)
    }

    pub fn decimal(max_digits: u32, decimal_places: u32) -> Self {
        Self::new(FieldKind::Decimal {
            max_digits,
            decimal_places,
        })
    }

    pub fn date() -> Self {
        Self::new(FieldKind::Date)
    }

    pub fn date_time() -> Self {
        Self::new(FieldKind::DateTime)
    }

    pub fn foreign_key(to: impl Into<ModelRef>, on_delete: OnDelete) -> Self {
        Self::new(FieldKind::ForeignKey {
            to: to.into(),
            on_delete,
        })
    }

    pub fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<DefaultValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_choices<C, L>(mut self, choices: impl IntoIterator<Item = (C, L)>) -> Self
    where
        C: Into<String>,
        L: Into<String>,
    {
        self.choices = choices
            .into_iter()
            .map(|(code, label)| Choice(code.into(), label.into()))
            .collect();
        self
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.kind, FieldKind::ForeignKey { .. })
    }

    /// Check the shape's own invariants.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match &self.kind {
            FieldKind::Char { max_length: 0 } => {
                return Err("max_length must be positive".into());
            }
            FieldKind::Decimal {
                max_digits,
                decimal_places,
            } => {
                if *max_digits == 0 {
                    return Err("max_digits must be positive".into());
                }
                if decimal_places > max_digits {
                    return Err(format!(
                        "decimal_places ({decimal_places}) exceeds max_digits ({max_digits})"
                    ));
                }
            }
            FieldKind::ForeignKey { on_delete, .. } => {
                if *on_delete == OnDelete::SetNull && !self.null {
                    return Err("on_delete set_null requires null: true".into());
                }
            }
            FieldKind::Auto => {
                if self.null {
                    return Err("auto field cannot be null".into());
                }
                if self.default.is_some() {
                    return Err("auto field cannot have a default".into());
                }
            }
            _ => {}
        }

        if !self.choices.is_empty() {
            if matches!(self.kind, FieldKind::Auto | FieldKind::ForeignKey { .. }) {
                return Err(format!("{} fields cannot declare choices", self.kind));
            }
            let mut codes = HashSet::new();
            for Choice(code, _) in &self.choices {
                if !codes.insert(code.as_str()) {
                    return Err(format!("duplicate choice code '{code}'"));
                }
            }
        }

        if let Some(default) = &self.default {
            self.check_value(&default.as_text())
                .map_err(|e| format!("default {e}"))?;
        }
        Ok(())
    }

    /// Whether a value, in its text form, satisfies this shape's constraints.
    pub fn check_value(&self, value: &str) -> std::result::Result<(), String> {
        match &self.kind {
            FieldKind::Char { max_length } => {
                let len = value.chars().count();
                if len > *max_length as usize {
                    return Err(format!(
                        "'{value}' is {len} characters, longer than max_length {max_length}"
                    ));
                }
            }
            FieldKind::Decimal {
                max_digits,
                decimal_places,
            } => {
                if !decimal_fits(value, *max_digits, *decimal_places) {
                    return Err(format!(
                        "'{value}' does not fit decimal({max_digits}, {decimal_places})"
                    ));
                }
            }
            _ => {}
        }
        if !self.choices.is_empty() && !self.choices.iter().any(|Choice(code, _)| code == value) {
            return Err(format!("'{value}' is not one of the allowed choices"));
        }
        Ok(())
    }
}

/// Closed set of column types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Auto,
    Integer,
    BigInteger,
    Boolean,
    Float,
    Char {
        max_length: u32,
    },
    Text,
    Decimal {
        max_digits: u32,
        decimal_places: u32,
    },
    Date,
    DateTime,
    ForeignKey {
        to: ModelRef,
        on_delete: OnDelete,
    },
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Auto => f.write_str("auto"),
            FieldKind::Integer => f.write_str("integer"),
            FieldKind::BigInteger => f.write_str("big_integer"),
            FieldKind::Boolean => f.write_str("boolean"),
            FieldKind::Float => f.write_str("float"),
            FieldKind::Char { max_length } => write!(f, "char({max_length})"),
            FieldKind::Text => f.write_str("text"),
            FieldKind::Decimal {
                max_digits,
                decimal_places,
            } => write!(f, "decimal({max_digits}, {decimal_places})"),
            FieldKind::Date => f.write_str("date"),
            FieldKind::DateTime => f.write_str("date_time"),
            FieldKind::ForeignKey { to, on_delete } => {
                write!(f, "foreign_key({to}, {on_delete})")
            }
        }
    }
}

/// Target of a foreign key: a model label such as `auth.user`, or a
/// swappable setting resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelRef {
    Setting { setting: String },
    Model(String),
}

impl ModelRef {
    pub fn setting(name: impl Into<String>) -> Self {
        ModelRef::Setting {
            setting: name.into(),
        }
    }

    /// `(app, model)` once resolved.
    pub fn app_and_model(&self) -> Option<(String, String)> {
        match self {
            ModelRef::Model(label) => {
                let label = label.to_lowercase();
                split_label(&label).map(|(app, model)| (app.to_string(), model.to_string()))
            }
            ModelRef::Setting { .. } => None,
        }
    }
}

impl From<&str> for ModelRef {
    fn from(label: &str) -> Self {
        ModelRef::Model(label.to_string())
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelRef::Model(label) => f.write_str(label),
            ModelRef::Setting { setting } => write!(f, "${setting}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    Cascade,
    SetNull,
    Protect,
    NoAction,
}

impl OnDelete {
    pub fn sql(self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
            OnDelete::Protect => "RESTRICT",
            OnDelete::NoAction => "NO ACTION",
        }
    }
}

impl fmt::Display for OnDelete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OnDelete::Cascade => "cascade",
            OnDelete::SetNull => "set_null",
            OnDelete::Protect => "protect",
            OnDelete::NoAction => "no_action",
        })
    }
}

/// An allowed `(code, label)` pair. Only the code is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice(pub String, pub String);

impl Choice {
    pub fn code(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl DefaultValue {
    pub fn as_text(&self) -> String {
        match self {
            DefaultValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            DefaultValue::Integer(i) => i.to_string(),
            DefaultValue::Float(x) => x.to_string(),
            DefaultValue::Text(s) => s.clone(),
        }
    }

    pub fn sql_literal(&self) -> String {
        match self {
            DefaultValue::Text(s) => quote_literal(s),
            other => other.as_text(),
        }
    }
}

impl From<bool> for DefaultValue {
    fn from(value: bool) -> Self {
        DefaultValue::Bool(value)
    }
}

impl From<i64> for DefaultValue {
    fn from(value: i64) -> Self {
        DefaultValue::Integer(value)
    }
}

impl From<f64> for DefaultValue {
    fn from(value: f64) -> Self {
        DefaultValue::Float(value)
    }
}

impl From<&str> for DefaultValue {
    fn from(value: &str) -> Self {
        DefaultValue::Text(value.to_string())
    }
}

/// Split `app.model`.
pub(crate) fn split_label(label: &str) -> Option<(&str, &str)> {
    match label.split_once('.') {
        Some((app, model)) if !app.is_empty() && !model.is_empty() => Some((app, model)),
        _ => None,
    }
}

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Whether the decimal literal `value` has at most `max_digits` significant
/// digits, `decimal_places` of them after the point. Leading zeros of the
/// integer part do not count.
pub fn decimal_fits(value: &str, max_digits: u32, decimal_places: u32) -> bool {
    let unsigned = value.strip_prefix('-').unwrap_or(value);
    if unsigned.is_empty()
        || !unsigned.chars().all(|c| c.is_ascii_digit() || c == '.')
        || !unsigned.chars().any(|c| c.is_ascii_digit())
        || unsigned.matches('.').count() > 1
    {
        return false;
    }
    let (integer, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let integer_digits = integer.trim_start_matches('0').len();
    fraction.len() <= decimal_places as usize
        && integer_digits <= max_digits.saturating_sub(decimal_places) as usize
}
