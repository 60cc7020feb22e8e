//! Renders operations as SQLite DDL.
//!
//! SQLite cannot alter a column in place, so field changes rebuild the
//! table: create `new__<table>` with the new definition, copy the rows,
//! drop the old table and rename the new one into place. Constraints SQLite
//! does not enforce from the declared type (length, decimal precision,
//! choice sets) become `CHECK` constraints. Decimals are stored as text so
//! the digits written are the digits kept; a numeric column would round
//! them through a 64-bit float.

use crate::migrations::{FieldDef, FieldKind, Operation, quote_literal};
use crate::state::{ModelState, ProjectState, column_name};

/// Stateless renderer from operations to SQL statements.
pub struct SchemaEditor;

impl SchemaEditor {
    /// Statements that take the database from `before` to `after`, where
    /// `after` is `before` with `operation` applied.
    pub fn operation_sql(
        app: &str,
        operation: &Operation,
        before: &ProjectState,
        after: &ProjectState,
    ) -> Vec<String> {
        let Some(model) = after.model(app, operation.model()) else {
            return Vec::new();
        };

        match operation {
            Operation::CreateModel { .. } => {
                let mut statements = vec![Self::create_table(model, &model.table())];
                statements.extend(Self::relation_indexes(model));
                statements
            }
            Operation::AddField { field, .. } | Operation::AlterField { field, .. } => {
                match before.model(app, operation.model()) {
                    Some(old) => Self::remake_table(old, model, field),
                    None => Vec::new(),
                }
            }
        }
    }

    /// Table whose rows an operation rewrites, for post-operation checks.
    pub fn affected_table(app: &str, operation: &Operation) -> String {
        format!("{app}_{}", operation.model().to_lowercase())
    }

    pub fn create_table(model: &ModelState, table: &str) -> String {
        let columns = model
            .fields
            .iter()
            .map(Self::column_definition)
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {} ({columns})", quote_ident(table))
    }

    fn remake_table(old: &ModelState, new: &ModelState, altered: &str) -> Vec<String> {
        let table = new.table();
        let temp = format!("new__{table}");

        let mut targets = Vec::new();
        let mut sources = Vec::new();
        for field in &new.fields {
            let Some(previous) = old.field(&field.name) else {
                // Added fields start from their default.
                continue;
            };
            targets.push(quote_ident(&column_name(field)));

            let source = quote_ident(&column_name(previous));
            let fill_nulls = field.name == altered && previous.shape.null && !field.shape.null;
            match (&field.shape.default, fill_nulls) {
                (Some(default), true) => {
                    sources.push(format!("coalesce({source}, {})", default.sql_literal()))
                }
                _ => sources.push(source),
            }
        }

        let mut statements = vec![Self::create_table(new, &temp)];
        if !targets.is_empty() {
            statements.push(format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                quote_ident(&temp),
                targets.join(", "),
                sources.join(", "),
                quote_ident(&table)
            ));
        }
        statements.push(format!("DROP TABLE {}", quote_ident(&table)));
        statements.push(format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&temp),
            quote_ident(&table)
        ));
        statements.extend(Self::relation_indexes(new));
        statements
    }

    fn relation_indexes(model: &ModelState) -> Vec<String> {
        let table = model.table();
        model
            .fields
            .iter()
            .filter(|f| f.shape.is_relation())
            .map(|f| {
                let column = column_name(f);
                format!(
                    "CREATE INDEX {} ON {} ({})",
                    quote_ident(&format!("{table}_{column}_idx")),
                    quote_ident(&table),
                    quote_ident(&column)
                )
            })
            .collect()
    }

    pub fn column_definition(field: &FieldDef) -> String {
        let column = column_name(field);
        let shape = &field.shape;
        let mut parts = vec![quote_ident(&column), sql_type(&shape.kind)];

        if shape.kind == FieldKind::Auto {
            parts.push("NOT NULL PRIMARY KEY AUTOINCREMENT".into());
            return parts.join(" ");
        }

        parts.push(if shape.null { "NULL" } else { "NOT NULL" }.into());
        if let Some(default) = &shape.default {
            parts.push(format!("DEFAULT {}", default.sql_literal()));
        }

        let quoted = quote_ident(&column);
        match &shape.kind {
            FieldKind::Char { max_length } => {
                parts.push(format!("CHECK (length({quoted}) <= {max_length})"));
            }
            FieldKind::Decimal {
                max_digits,
                decimal_places,
            } => {
                parts.push(format!(
                    "CHECK ({})",
                    decimal_check(&quoted, *max_digits, *decimal_places)
                ));
            }
            FieldKind::Boolean => parts.push(format!("CHECK ({quoted} IN (0, 1))")),
            _ => {}
        }

        if !shape.choices.is_empty() {
            let codes = shape
                .choices
                .iter()
                .map(|c| quote_literal(c.code()))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("CHECK ({quoted} IN ({codes}))"));
        }

        if let FieldKind::ForeignKey { to, on_delete } = &shape.kind {
            if let Some((app, model)) = to.app_and_model() {
                parts.push(format!(
                    "REFERENCES {} (\"id\") ON DELETE {} DEFERRABLE INITIALLY DEFERRED",
                    quote_ident(&format!("{app}_{model}")),
                    on_delete.sql()
                ));
            }
        }

        parts.join(" ")
    }
}

fn sql_type(kind: &FieldKind) -> String {
    match kind {
        FieldKind::Auto | FieldKind::Integer => "integer".into(),
        FieldKind::BigInteger | FieldKind::ForeignKey { .. } => "bigint".into(),
        FieldKind::Boolean => "bool".into(),
        FieldKind::Float => "real".into(),
        FieldKind::Char { max_length } => format!("varchar({max_length})"),
        FieldKind::Text => "text".into(),
        FieldKind::Decimal { .. } => "text".into(),
        FieldKind::Date => "date".into(),
        FieldKind::DateTime => "datetime".into(),
    }
}

/// SQL mirror of [`crate::migrations::decimal_fits`] for an already quoted
/// column.
fn decimal_check(column: &str, max_digits: u32, decimal_places: u32) -> String {
    let text = format!("CAST({column} AS TEXT)");
    let digits = format!(
        "(CASE WHEN substr({text}, 1, 1) = '-' THEN substr({text}, 2) ELSE {text} END)"
    );
    let dot = format!("instr({digits}, '.')");
    let integer_digits = max_digits.saturating_sub(decimal_places);
    format!(
        "{digits} NOT GLOB '*[^0-9.]*' AND {digits} GLOB '*[0-9]*' AND {digits} NOT GLOB '*.*.*' \
         AND ({dot} = 0 OR length({digits}) - {dot} <= {decimal_places}) \
         AND length(ltrim(CASE WHEN {dot} = 0 THEN {digits} ELSE substr({digits}, 1, {dot} - 1) END, '0')) <= {integer_digits}"
    )
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
