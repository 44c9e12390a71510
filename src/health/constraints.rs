use crate::db::PgDriver;
use crate::error::Result;
use crate::version::VersionProbe;

use super::{Finding, HealthReport, HealthType};

#[derive(Debug, Clone)]
struct ConstraintRow {
    schema: String,
    table: String,
    name: String,
    referenced_table: Option<String>,
    validated: bool,
    enforced: bool,
}

pub(super) async fn run(driver: &PgDriver, probe: &VersionProbe) -> Result<HealthReport> {
    // conenforced arrived with NOT ENFORCED constraints in PG 18.
    let has_conenforced = probe
        .has_column(driver, "pg_catalog", "pg_constraint", "conenforced")
        .await?;

    let enforced_select = if has_conenforced {
        "con.conenforced AS enforced"
    } else {
        "TRUE AS enforced"
    };
    let where_clause = if has_conenforced {
        "(con.convalidated = false OR con.conenforced = false)"
    } else {
        "con.convalidated = false"
    };

    let query = format!(
        r#"
        SELECT
            nsp.nspname AS schema_name,
            rel.relname AS table_name,
            con.conname AS constraint_name,
            frel.relname AS referenced_table,
            con.convalidated AS validated,
            {enforced_select}
        FROM pg_catalog.pg_constraint con
        INNER JOIN pg_catalog.pg_class rel ON rel.oid = con.conrelid
        LEFT JOIN pg_catalog.pg_class frel ON frel.oid = con.confrelid
        LEFT JOIN pg_catalog.pg_namespace nsp ON nsp.oid = con.connamespace
        WHERE {where_clause}
        "#,
    );

    let rows = driver.execute(&query, &[]).await?;
    let constraints: Vec<ConstraintRow> = rows
        .iter()
        .filter_map(|row| {
            Some(ConstraintRow {
                schema: row.as_str("schema_name").unwrap_or("public").to_string(),
                table: row.as_str("table_name")?.to_string(),
                name: row.as_str("constraint_name")?.to_string(),
                referenced_table: row.as_str("referenced_table").map(str::to_string),
                validated: row.as_bool("validated").unwrap_or(true),
                enforced: row.as_bool("enforced").unwrap_or(true),
            })
        })
        .collect();

    let mut findings = classify(&constraints);
    if findings.is_empty() {
        findings.push(Finding::ok("No invalid or not-enforced constraints."));
    }
    Ok(HealthReport::from_findings(HealthType::Constraint, findings))
}

fn classify(constraints: &[ConstraintRow]) -> Vec<Finding> {
    constraints
        .iter()
        .map(|con| {
            let issue = match (con.validated, con.enforced) {
                (false, false) => "is NOT VALID and NOT ENFORCED",
                (false, true) => "is NOT VALID",
                _ => "is NOT ENFORCED",
            };
            let referenced = con
                .referenced_table
                .as_deref()
                .map(|t| format!(" referencing {t}"))
                .unwrap_or_default();
            Finding::warning(format!(
                "Constraint {} on {}.{}{referenced} {issue}; run VALIDATE CONSTRAINT \
                 once the data is clean.",
                con.name, con.schema, con.table
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Severity;

    #[test]
    fn not_valid_and_not_enforced_are_both_described() {
        let constraints = vec![
            ConstraintRow {
                schema: "public".into(),
                table: "orders".into(),
                name: "orders_customer_fk".into(),
                referenced_table: Some("customers".into()),
                validated: false,
                enforced: true,
            },
            ConstraintRow {
                schema: "public".into(),
                table: "orders".into(),
                name: "orders_total_check".into(),
                referenced_table: None,
                validated: true,
                enforced: false,
            },
        ];
        let findings = classify(&constraints);
        assert_eq!(findings.len(), 2);
        assert!(findings[0].message.contains("NOT VALID"));
        assert!(findings[0].message.contains("customers"));
        assert!(findings[1].message.contains("NOT ENFORCED"));
        assert!(findings.iter().all(|f| f.severity == Severity::Warning));
    }
}
