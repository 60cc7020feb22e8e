use std::fmt::Write as _;

use serde_json::json;
use tidemark_db::{MigrateReport, Migration, MigrationStatus};

/// Human-readable plan: each migration followed by its operations.
pub fn render_plan(plan: &[&Migration]) -> String {
    if plan.is_empty() {
        return "No planned migration operations.\n".to_string();
    }

    let mut out = String::from("Planned operations:\n");
    for migration in plan {
        let _ = writeln!(out, "  {}", migration.key);
        if migration.operations.is_empty() {
            let _ = writeln!(out, "    (no operations)");
        }
        for operation in &migration.operations {
            let _ = writeln!(out, "    - {}", operation.describe());
        }
    }
    out
}

pub fn plan_json(plan: &[&Migration]) -> serde_json::Value {
    json!(
        plan.iter()
            .map(|m| json!({
                "migration": m.key.to_string(),
                "operations": m.operations.iter().map(|op| op.describe()).collect::<Vec<_>>(),
            }))
            .collect::<Vec<_>>()
    )
}

pub fn render_report(report: &MigrateReport) -> String {
    if report.applied.is_empty() {
        return "No migrations to apply.\n".to_string();
    }

    let verb = if report.faked { "FAKED" } else { "OK" };
    let mut out = String::from("Running migrations:\n");
    for key in &report.applied {
        let _ = writeln!(out, "  Applying {key}... {verb}");
    }
    out
}

/// `showmigrations` listing, grouped by app with `[X]` for applied rows.
pub fn render_status(rows: &[MigrationStatus]) -> String {
    let mut out = String::new();
    let mut current_app: Option<&str> = None;
    for row in rows {
        if current_app != Some(row.key.app.as_str()) {
            let _ = writeln!(out, "{}", row.key.app);
            current_app = Some(row.key.app.as_str());
        }
        let mark = if row.applied_at.is_some() { "X" } else { " " };
        let _ = writeln!(out, " [{mark}] {}", row.key.name);
    }
    if out.is_empty() {
        out.push_str("(no migrations)\n");
    }
    out
}

/// Terminates statements for pasting into a SQL shell. Comment lines are
/// left as they are.
pub fn render_sql(statements: &[String]) -> String {
    let mut out = String::from("BEGIN;\n");
    for statement in statements {
        if statement.starts_with("--") {
            let _ = writeln!(out, "{statement}");
        } else {
            let _ = writeln!(out, "{statement};");
        }
    }
    out.push_str("COMMIT;\n");
    out
}

#[cfg(test)]
mod tests {
    use tidemark_common::MigrationKey;
    use tidemark_db::{FieldDef, FieldShape, Operation};

    use super::*;

    fn migration() -> Migration {
        Migration::new("myapp", "0010_widen").operation(Operation::alter_field(
            "customer",
            "email",
            FieldShape::char(150),
        ))
    }

    #[test]
    fn plan_lists_operations_under_each_migration() {
        let migration = migration();
        let created = Migration::new("auth", "0001_initial").operation(Operation::create_model(
            "user",
            vec![FieldDef::new("username", FieldShape::char(150))],
        ));
        let text = render_plan(&[&created, &migration]);
        assert_eq!(
            text,
            "Planned operations:\n  auth.0001_initial\n    - create model user\n  myapp.0010_widen\n    - alter field customer.email\n"
        );
    }

    #[test]
    fn empty_plan_says_so() {
        assert_eq!(render_plan(&[]), "No planned migration operations.\n");
    }

    #[test]
    fn plan_json_names_migrations() {
        let migration = migration();
        let value = plan_json(&[&migration]);
        assert_eq!(value[0]["migration"], "myapp.0010_widen");
        assert_eq!(value[0]["operations"][0], "alter field customer.email");
    }

    #[test]
    fn status_groups_by_app() {
        let rows = vec![
            MigrationStatus {
                key: MigrationKey::new("auth", "0001_initial"),
                applied_at: Some("2025-06-05T17:44:00Z".parse().unwrap()),
            },
            MigrationStatus {
                key: MigrationKey::new("myapp", "0001_initial"),
                applied_at: Some("2025-06-05T17:44:00Z".parse().unwrap()),
            },
            MigrationStatus {
                key: MigrationKey::new("myapp", "0005_alter"),
                applied_at: None,
            },
        ];
        assert_eq!(
            render_status(&rows),
            "auth\n [X] 0001_initial\nmyapp\n [X] 0001_initial\n [ ] 0005_alter\n"
        );
    }

    #[test]
    fn report_marks_faked_runs() {
        let report = MigrateReport {
            applied: vec![MigrationKey::new("auth", "0001_initial")],
            faked: true,
        };
        assert_eq!(
            render_report(&report),
            "Running migrations:\n  Applying auth.0001_initial... FAKED\n"
        );
    }

    #[test]
    fn sql_is_wrapped_in_a_transaction() {
        let statements = vec![
            "-- alter field customer.email".to_string(),
            "DROP TABLE \"myapp_customer\"".to_string(),
        ];
        assert_eq!(
            render_sql(&statements),
            "BEGIN;\n-- alter field customer.email\nDROP TABLE \"myapp_customer\";\nCOMMIT;\n"
        );
    }
}
