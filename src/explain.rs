//! EXPLAIN engine: JSON plans with optional ANALYZE/BUFFERS/GENERIC_PLAN,
//! version-gated PG 17 options, and hypothetical-index "what-if" runs.
//!
//! Hypothetical indexes are session-scoped HypoPG objects; every code path
//! through here drops them before the borrowed connection is released.

use serde_json::{json, Value};
use sqlx::PgConnection;
use tracing::warn;

use crate::config::AccessMode;
use crate::db::driver::execute_on;
use crate::db::guard::{check_sql, verify_relation_access, RelationRef, StatementKind};
use crate::db::{Driver, SqlRow};
use crate::error::{DbaError, Result};
use crate::models::{ExplainArtifact, IndexDefinition};
use crate::version::{ServerInfo, VersionProbe};

pub const HYPOPG: &str = "hypopg";

const GENERIC_PLAN_MAJOR: i32 = 16;
const MEMORY_MAJOR: i32 = 17;
const SERIALIZE_MAJOR: i32 = 17;

#[derive(Debug, Clone, Default)]
pub struct ExplainOptions {
    pub analyze: bool,
    pub buffers: bool,
    pub generic_plan: bool,
    pub memory: bool,
    pub serialize: bool,
    pub hypothetical_indexes: Vec<IndexDefinition>,
}

pub async fn explain(
    driver: &Driver,
    probe: &VersionProbe,
    sql: &str,
    params: &[Value],
    options: &ExplainOptions,
) -> Result<ExplainArtifact> {
    let info = probe.server_info(driver.base()).await?;
    let relations = validate_options(driver.access_mode(), info, sql, options)?;
    if !relations.is_empty() {
        verify_relation_access(driver.base(), &relations).await?;
    }

    let (target_sql, best_effort) = resolve_parameters(sql, params, options.generic_plan, info)?;
    let explain_sql = format!(
        "EXPLAIN ({}) {}",
        option_list(options, info).join(", "),
        target_sql
    );

    if !options.hypothetical_indexes.is_empty() {
        probe.require_extension(driver.base(), HYPOPG).await?;
    }

    let mut conn = driver.base().pool().acquire().await?;
    let rows = run_with_hypotheticals(&mut conn, &options.hypothetical_indexes, &explain_sql).await;
    drop(conn);

    let plan = parse_plan_rows(&rows?)?;
    Ok(build_artifact(info, options, plan, best_effort))
}

/// Returns the relations to verify against the schema allowlist when the
/// access mode requires it (empty in unrestricted mode).
fn validate_options(
    mode: AccessMode,
    info: ServerInfo,
    sql: &str,
    options: &ExplainOptions,
) -> Result<Vec<RelationRef>> {
    if options.memory && info.major < MEMORY_MAJOR {
        return Err(DbaError::UnsupportedOption {
            option: "memory".into(),
            required_major: MEMORY_MAJOR,
        });
    }
    if options.serialize {
        if info.major < SERIALIZE_MAJOR {
            return Err(DbaError::UnsupportedOption {
                option: "serialize".into(),
                required_major: SERIALIZE_MAJOR,
            });
        }
        if !options.analyze {
            return Err(DbaError::InvalidArguments {
                message: "serialize requires analyze".into(),
            });
        }
    }
    if options.analyze && options.generic_plan {
        return Err(DbaError::InvalidArguments {
            message: "generic_plan cannot be combined with analyze".into(),
        });
    }
    if options.analyze && !options.hypothetical_indexes.is_empty() {
        return Err(DbaError::InvalidArguments {
            message: "analyze cannot be combined with hypothetical indexes".into(),
        });
    }
    for definition in &options.hypothetical_indexes {
        definition.validate()?;
    }
    if mode == AccessMode::Restricted {
        let checked = check_sql(sql, options.analyze)?;
        if options.analyze && checked.kind != StatementKind::Select {
            return Err(DbaError::StatementNotAllowed {
                node: "ExplainAnalyze".into(),
            });
        }
        return Ok(checked.relations);
    }
    Ok(Vec::new())
}

fn option_list(options: &ExplainOptions, info: ServerInfo) -> Vec<String> {
    let mut list = vec!["FORMAT JSON".to_string()];
    if options.analyze {
        list.push("ANALYZE".into());
    }
    if options.buffers {
        list.push("BUFFERS".into());
    }
    if options.generic_plan && info.major >= GENERIC_PLAN_MAJOR {
        list.push("GENERIC_PLAN".into());
    }
    if options.memory {
        list.push("MEMORY".into());
    }
    if options.serialize {
        list.push("SERIALIZE".into());
    }
    list
}

/// Turn `$n` markers into something the planner will accept: literal
/// values when the caller supplied them, a native generic plan on PG 16+,
/// or typed-null substitution (flagged best-effort) before that.
fn resolve_parameters(
    sql: &str,
    params: &[Value],
    generic_plan: bool,
    info: ServerInfo,
) -> Result<(String, bool)> {
    if !params.is_empty() {
        let substituted = replace_markers(sql, |idx| {
            params.get(idx).map(render_literal).ok_or_else(|| {
                DbaError::InvalidArguments {
                    message: format!("parameter ${} has no value", idx + 1),
                }
            })
        })?;
        return Ok((substituted, false));
    }
    if !has_parameter_markers(sql) {
        return Ok((sql.to_string(), false));
    }
    if generic_plan && info.major >= GENERIC_PLAN_MAJOR {
        return Ok((sql.to_string(), false));
    }
    let substituted = replace_markers(sql, |_| Ok("NULL".to_string()))?;
    Ok((substituted, true))
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'::jsonb", other.to_string().replace('\'', "''")),
    }
}

fn has_parameter_markers(sql: &str) -> bool {
    scan_markers(sql, |_| Ok::<String, DbaError>(String::new()))
        .map(|(_, found)| found)
        .unwrap_or(false)
}

fn replace_markers(
    sql: &str,
    replacement: impl Fn(usize) -> Result<String>,
) -> Result<String> {
    scan_markers(sql, replacement).map(|(out, _)| out)
}

/// Walk the SQL once, honoring single-quoted strings, and hand each `$n`
/// marker (1-based) to `replacement` as a 0-based index.
fn scan_markers<E>(
    sql: &str,
    replacement: impl Fn(usize) -> std::result::Result<String, E>,
) -> std::result::Result<(String, bool), E> {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut found = false;
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_quote {
            out.push(c);
            if c == '\'' {
                in_quote = false;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' => {
                in_quote = true;
                out.push(c);
                i += 1;
            }
            '$' if i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                let ordinal: usize = sql[i + 1..j].parse().unwrap_or(0);
                if ordinal == 0 {
                    out.push_str(&sql[i..j]);
                } else {
                    found = true;
                    out.push_str(&replacement(ordinal - 1)?);
                }
                i = j;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok((out, found))
}

/// Install the hypothetical indexes, run the statement, and reset HypoPG
/// no matter what happened.
async fn run_with_hypotheticals(
    conn: &mut PgConnection,
    definitions: &[IndexDefinition],
    explain_sql: &str,
) -> Result<Vec<SqlRow>> {
    if definitions.is_empty() {
        return execute_on(conn, explain_sql, &[]).await;
    }
    let outcome = install_and_run(conn, definitions, explain_sql).await;
    if let Err(err) = execute_on(conn, "SELECT hypopg_reset()", &[]).await {
        warn!("hypopg_reset failed after explain: {err}");
    }
    outcome
}

async fn install_and_run(
    conn: &mut PgConnection,
    definitions: &[IndexDefinition],
    explain_sql: &str,
) -> Result<Vec<SqlRow>> {
    for definition in definitions {
        execute_on(
            conn,
            "SELECT indexrelid, indexname FROM hypopg_create_index($1)",
            &[json!(definition.ddl())],
        )
        .await?;
    }
    execute_on(conn, explain_sql, &[]).await
}

fn parse_plan_rows(rows: &[SqlRow]) -> Result<Value> {
    let cell = rows
        .first()
        .and_then(|row| row.cells.values().next())
        .ok_or_else(|| DbaError::internal("EXPLAIN returned no rows"))?;
    let parsed: Value = match cell {
        Value::String(text) => serde_json::from_str(text)
            .map_err(|e| DbaError::internal(format!("unparseable EXPLAIN output: {e}")))?,
        other => other.clone(),
    };
    // EXPLAIN (FORMAT JSON) wraps the plan in a one-element array.
    Ok(parsed
        .as_array()
        .and_then(|items| items.first())
        .cloned()
        .unwrap_or(parsed))
}

fn build_artifact(
    info: ServerInfo,
    options: &ExplainOptions,
    plan: Value,
    best_effort: bool,
) -> ExplainArtifact {
    let total_cost = plan
        .get("Plan")
        .and_then(|p| p.get("Total Cost"))
        .and_then(Value::as_f64);
    let actual_total_time_ms = plan
        .get("Plan")
        .and_then(|p| p.get("Actual Total Time"))
        .and_then(Value::as_f64);
    let mut names = Vec::new();
    if options.analyze {
        names.push("analyze".to_string());
    }
    if options.buffers {
        names.push("buffers".to_string());
    }
    if options.generic_plan {
        names.push("generic_plan".to_string());
    }
    if options.memory {
        names.push("memory".to_string());
    }
    if options.serialize {
        names.push("serialize".to_string());
    }
    ExplainArtifact {
        server_version_num: info.server_version_num,
        options: names,
        hypothetical_indexes: options.hypothetical_indexes.clone(),
        total_cost,
        actual_total_time_ms,
        best_effort,
        plan,
    }
}

/// Cost one query with whatever hypothetical indexes are currently in the
/// session. The advisor calls this in a tight loop on one connection.
pub(crate) async fn generic_plan_cost(
    conn: &mut PgConnection,
    info: ServerInfo,
    sql: &str,
) -> Result<f64> {
    let (target_sql, _) = resolve_parameters(sql, &[], true, info)?;
    let explain_sql = if has_parameter_markers(&target_sql) && info.major >= GENERIC_PLAN_MAJOR {
        format!("EXPLAIN (FORMAT JSON, GENERIC_PLAN) {target_sql}")
    } else {
        format!("EXPLAIN (FORMAT JSON) {target_sql}")
    };
    let rows = execute_on(conn, &explain_sql, &[]).await?;
    let plan = parse_plan_rows(&rows)?;
    plan.get("Plan")
        .and_then(|p| p.get("Total Cost"))
        .and_then(Value::as_f64)
        .ok_or_else(|| DbaError::internal("plan has no Total Cost"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TableRef;

    fn info(major: i32) -> ServerInfo {
        ServerInfo {
            server_version_num: major * 10_000,
            major,
        }
    }

    #[test]
    fn substitutes_supplied_parameters_as_literals() {
        let (sql, best_effort) = resolve_parameters(
            "SELECT * FROM orders WHERE customer_id = $1 AND note = $2",
            &[json!(42), json!("a'b")],
            false,
            info(15),
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM orders WHERE customer_id = 42 AND note = 'a''b'"
        );
        assert!(!best_effort);
    }

    #[test]
    fn keeps_markers_for_native_generic_plan() {
        let (sql, best_effort) =
            resolve_parameters("SELECT * FROM t WHERE a = $1", &[], true, info(16)).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = $1");
        assert!(!best_effort);
    }

    #[test]
    fn null_substitutes_markers_before_pg16() {
        let (sql, best_effort) =
            resolve_parameters("SELECT * FROM t WHERE a = $1", &[], true, info(15)).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = NULL");
        assert!(best_effort);
    }

    #[test]
    fn markers_inside_string_literals_are_untouched() {
        let (sql, _) =
            resolve_parameters("SELECT '$1' FROM t WHERE a = $1", &[json!(7)], false, info(16))
                .unwrap();
        assert_eq!(sql, "SELECT '$1' FROM t WHERE a = 7");
    }

    #[test]
    fn missing_parameter_value_is_an_error() {
        let err =
            resolve_parameters("SELECT * FROM t WHERE a = $2", &[json!(1)], false, info(16))
                .unwrap_err();
        assert!(matches!(err, DbaError::InvalidArguments { .. }));
    }

    #[test]
    fn memory_option_requires_pg17() {
        let options = ExplainOptions {
            memory: true,
            ..Default::default()
        };
        let err =
            validate_options(AccessMode::Unrestricted, info(16), "SELECT 1", &options).unwrap_err();
        assert!(matches!(
            err,
            DbaError::UnsupportedOption {
                required_major: 17,
                ..
            }
        ));
    }

    #[test]
    fn serialize_requires_analyze() {
        let options = ExplainOptions {
            serialize: true,
            ..Default::default()
        };
        let err =
            validate_options(AccessMode::Unrestricted, info(17), "SELECT 1", &options).unwrap_err();
        assert!(matches!(err, DbaError::InvalidArguments { .. }));
    }

    #[test]
    fn analyze_conflicts_with_hypothetical_indexes() {
        let options = ExplainOptions {
            analyze: true,
            hypothetical_indexes: vec![IndexDefinition::btree(
                TableRef::new(None, "orders"),
                vec!["customer_id".into()],
            )],
            ..Default::default()
        };
        let err =
            validate_options(AccessMode::Unrestricted, info(16), "SELECT 1", &options).unwrap_err();
        assert!(matches!(err, DbaError::InvalidArguments { .. }));
    }

    #[test]
    fn restricted_mode_checks_the_statement() {
        let options = ExplainOptions::default();
        let err = validate_options(AccessMode::Restricted, info(16), "DROP TABLE t", &options)
            .unwrap_err();
        assert!(matches!(err, DbaError::StatementNotAllowed { .. }));
    }

    #[test]
    fn parses_wrapped_plan_and_extracts_costs() {
        let payload = r#"[{"Plan": {"Node Type": "Seq Scan", "Total Cost": 155.0, "Custom Key": 1}}]"#;
        let mut cells = serde_json::Map::new();
        cells.insert("QUERY PLAN".to_string(), json!(payload));
        let plan = parse_plan_rows(&[SqlRow { cells }]).unwrap();
        assert_eq!(plan["Plan"]["Total Cost"], json!(155.0));
        // Unknown keys ride along untouched.
        assert_eq!(plan["Plan"]["Custom Key"], json!(1));
    }

    #[test]
    fn artifact_carries_options_and_version() {
        let options = ExplainOptions {
            buffers: true,
            generic_plan: true,
            ..Default::default()
        };
        let plan = json!({"Plan": {"Total Cost": 12.5}});
        let artifact = build_artifact(info(16), &options, plan, false);
        assert_eq!(artifact.total_cost, Some(12.5));
        assert_eq!(artifact.options, vec!["buffers", "generic_plan"]);
        assert_eq!(artifact.server_version_num, 160_000);
    }
}
