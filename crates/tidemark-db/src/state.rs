use std::collections::BTreeMap;

use tidemark_common::{Error, Result};

use crate::migrations::{FieldDef, FieldKind, FieldShape, Migration, Operation};

/// In-memory schema snapshot: every model the applied operations have
/// produced, with its fields in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectState {
    models: BTreeMap<(String, String), ModelState>,
}

/// A single model and the table it maps to.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelState {
    pub app: String,
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl ModelState {
    /// Physical table name, `<app>_<model>`.
    pub fn table(&self) -> String {
        format!("{}_{}", self.app, self.name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Column a field is stored in. Relations get an `_id` suffix.
pub fn column_name(field: &FieldDef) -> String {
    if field.shape.is_relation() {
        format!("{}_id", field.name)
    } else {
        field.name.clone()
    }
}

impl ProjectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model(&self, app: &str, name: &str) -> Option<&ModelState> {
        self.models.get(&(app.to_string(), name.to_lowercase()))
    }

    /// Advance the snapshot by every operation of an already-applied
    /// migration. Used to rebuild state from the ledger.
    pub fn replay(&mut self, migration: &Migration) -> Result<()> {
        for operation in &migration.operations {
            self.apply(migration.app(), operation)
                .map_err(|reason| Error::InvalidMigration {
                    migration: migration.key.clone(),
                    reason: format!("{}: {reason}", operation.describe()),
                })?;
        }
        Ok(())
    }

    /// Apply one operation of app `app`. On error the state is unchanged.
    pub fn apply(&mut self, app: &str, operation: &Operation) -> std::result::Result<(), String> {
        let key = (app.to_string(), operation.model().to_lowercase());
        match operation {
            Operation::CreateModel { model, fields } => {
                if self.models.contains_key(&key) {
                    return Err(format!("model {app}.{model} already exists"));
                }

                let autos = fields
                    .iter()
                    .filter(|f| f.shape.kind == FieldKind::Auto)
                    .count();
                if autos > 1 {
                    return Err(format!("model {app}.{model} declares {autos} auto fields"));
                }

                let mut model_fields = Vec::with_capacity(fields.len() + 1);
                if autos == 0 {
                    model_fields.push(FieldDef::new("id", FieldShape::auto()));
                }
                for field in fields {
                    if autos == 0 && field.name == "id" {
                        return Err(format!(
                            "model {app}.{model} has a non-auto field named 'id'"
                        ));
                    }
                    field
                        .shape
                        .validate()
                        .map_err(|e| format!("field '{}': {e}", field.name))?;
                    self.check_target(&field.shape, Some(&key))?;
                    model_fields.push(field.clone());
                }

                self.models.insert(
                    key.clone(),
                    ModelState {
                        app: key.0,
                        name: key.1,
                        fields: model_fields,
                    },
                );
            }
            Operation::AddField { model, field, shape } => {
                shape.validate()?;
                if shape.kind == FieldKind::Auto {
                    return Err("cannot add an auto field to an existing model".into());
                }
                self.check_target(shape, Some(&key))?;
                let state = self
                    .models
                    .get_mut(&key)
                    .ok_or_else(|| format!("model {app}.{model} does not exist"))?;
                if state.field(field).is_some() {
                    return Err(format!("field {model}.{field} already exists"));
                }
                state.fields.push(FieldDef::new(field.clone(), shape.clone()));
            }
            Operation::AlterField { model, field, shape } => {
                shape.validate()?;
                self.check_target(shape, Some(&key))?;
                let state = self
                    .models
                    .get_mut(&key)
                    .ok_or_else(|| format!("model {app}.{model} does not exist"))?;
                let existing = state
                    .fields
                    .iter_mut()
                    .find(|f| &f.name == field)
                    .ok_or_else(|| format!("field {model}.{field} does not exist"))?;
                if (existing.shape.kind == FieldKind::Auto) != (shape.kind == FieldKind::Auto) {
                    return Err(format!(
                        "cannot change {model}.{field} to or from an auto primary key"
                    ));
                }
                existing.shape = shape.clone();
            }
        }
        Ok(())
    }

    /// Foreign keys must point at a known model, or at the model being
    /// defined.
    fn check_target(
        &self,
        shape: &FieldShape,
        current: Option<&(String, String)>,
    ) -> std::result::Result<(), String> {
        let FieldKind::ForeignKey { to, .. } = &shape.kind else {
            return Ok(());
        };
        let target = to
            .app_and_model()
            .ok_or_else(|| format!("foreign key target '{to}' is unresolved"))?;
        if Some(&target) == current || self.models.contains_key(&target) {
            Ok(())
        } else {
            Err(format!(
                "foreign key target {}.{} does not exist",
                target.0, target.1
            ))
        }
    }
}
