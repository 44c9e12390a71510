//! Restricted-mode SQL gatekeeper.
//!
//! Every statement executed by the guarded driver is parsed to an AST and
//! validated against a whitelist of read-only node kinds and functions
//! before it reaches the server. Relation access is a positive allowlist:
//! the walk collects every base-relation reference, and execution verifies
//! against the live catalog that each one resolves into `pg_catalog`,
//! `information_schema`, or a schema the connected role owns — anything
//! else is rejected, including unqualified names that resolve through
//! `search_path` into a foreign schema. Anything the parser cannot parse
//! at all is rejected with the closest structured kind. Execution then
//! runs inside a transaction with `SET LOCAL statement_timeout` so a
//! pathological query cannot hold a connection indefinitely.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};
use sqlparser::ast::{
    Distinct, Expr, Function, FunctionArg, FunctionArgExpr, GroupByExpr, Ident, JoinConstraint,
    JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins, WindowFrameBound, WindowSpec, WindowType,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::db::driver::{bind_params, row_to_json, PgDriver, SqlRow};
use crate::error::{DbaError, Result};

/// What a validated statement turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Explain,
    ExplainAnalyze,
    Show,
}

/// A base relation the statement references, as PostgreSQL would resolve
/// the identifiers (unquoted names folded to lowercase).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRef {
    pub schema: Option<String>,
    pub name: String,
}

/// Outcome of [`check_sql`]: the statement classification plus the
/// relations that still need catalog-side schema verification.
#[derive(Debug)]
pub struct CheckedStatement {
    pub kind: StatementKind,
    pub relations: Vec<RelationRef>,
}

/// Read-only functions the restricted driver lets through. Curated:
/// catalog introspection, privilege checks, time/text/math builtins,
/// aggregates, and window functions. Nothing that writes, invokes code,
/// or touches the filesystem. `hypopg_*` is allowed by prefix.
const ALLOWED_FUNCTIONS: &[&str] = &[
    // aggregates
    "array_agg",
    "avg",
    "bool_and",
    "bool_or",
    "count",
    "json_agg",
    "json_object_agg",
    "jsonb_agg",
    "jsonb_object_agg",
    "max",
    "min",
    "percentile_cont",
    "percentile_disc",
    "stddev",
    "stddev_pop",
    "stddev_samp",
    "string_agg",
    "sum",
    "variance",
    // window
    "dense_rank",
    "first_value",
    "lag",
    "last_value",
    "lead",
    "nth_value",
    "ntile",
    "rank",
    "row_number",
    // math
    "abs",
    "ceil",
    "ceiling",
    "exp",
    "floor",
    "greatest",
    "least",
    "ln",
    "log",
    "mod",
    "power",
    "random",
    "round",
    "sign",
    "sqrt",
    "trunc",
    "width_bucket",
    // text
    "btrim",
    "char_length",
    "concat",
    "concat_ws",
    "format",
    "initcap",
    "left",
    "length",
    "lower",
    "lpad",
    "ltrim",
    "md5",
    "position",
    "regexp_matches",
    "regexp_replace",
    "replace",
    "right",
    "rpad",
    "rtrim",
    "split_part",
    "strpos",
    "substr",
    "substring",
    "to_char",
    "to_number",
    "translate",
    "trim",
    "upper",
    // time
    "age",
    "clock_timestamp",
    "date_part",
    "date_trunc",
    "extract",
    "justify_interval",
    "now",
    "statement_timestamp",
    "to_date",
    "to_timestamp",
    // null handling / misc scalars
    "coalesce",
    "currval",
    "lastval",
    "num_nonnulls",
    "num_nulls",
    "nullif",
    "pg_column_size",
    "pg_typeof",
    // set-returning, read-only
    "generate_series",
    "generate_subscripts",
    "unnest",
    // json
    "json_array_elements",
    "json_array_length",
    "json_build_array",
    "json_build_object",
    "json_each",
    "json_extract_path",
    "json_extract_path_text",
    "jsonb_array_elements",
    "jsonb_array_length",
    "jsonb_build_array",
    "jsonb_build_object",
    "jsonb_each",
    "jsonb_extract_path",
    "jsonb_extract_path_text",
    "jsonb_path_query",
    "jsonb_pretty",
    "row_to_json",
    "to_json",
    "to_jsonb",
    // catalog introspection
    "col_description",
    "current_database",
    "current_schema",
    "current_schemas",
    "current_setting",
    "format_type",
    "obj_description",
    "pg_backend_pid",
    "pg_conf_load_time",
    "pg_current_wal_lsn",
    "pg_database_size",
    "pg_get_constraintdef",
    "pg_get_expr",
    "pg_get_functiondef",
    "pg_get_indexdef",
    "pg_get_userbyid",
    "pg_get_viewdef",
    "pg_indexes_size",
    "pg_is_in_recovery",
    "pg_last_wal_receive_lsn",
    "pg_last_wal_replay_lsn",
    "pg_last_xact_replay_timestamp",
    "pg_postmaster_start_time",
    "pg_relation_size",
    "pg_size_pretty",
    "pg_table_size",
    "pg_total_relation_size",
    "pg_wal_lsn_diff",
    "shobj_description",
    "version",
    // privilege checks
    "has_column_privilege",
    "has_database_privilege",
    "has_function_privilege",
    "has_schema_privilege",
    "has_sequence_privilege",
    "has_table_privilege",
    "pg_has_role",
];

/// Catalog relations that expose credentials; never readable in
/// restricted mode, qualified or not.
const PROTECTED_CATALOG_RELATIONS: &[&str] = &["pg_authid", "pg_shadow", "pg_user_mapping"];

/// Syntax the SQL parser does not understand yet but newer PostgreSQL
/// servers accept. Seeing one of these in unparseable input means the
/// parser is lagging the server, not that the input is malformed.
const NEWER_SYNTAX_MARKERS: &[&str] = &[
    "JSON_TABLE",
    "JSON_EXISTS",
    "JSON_QUERY",
    "JSON_VALUE",
    "JSON_SERIALIZE",
    "JSON_SCALAR",
];

/// Wraps the base driver; every statement passes [`check_sql`] plus the
/// catalog-side schema allowlist first and runs under a per-statement
/// timeout.
#[derive(Clone)]
pub struct GuardedDriver {
    inner: PgDriver,
    limit_ms: u64,
}

impl GuardedDriver {
    pub fn new(inner: PgDriver, limit_ms: u64) -> Self {
        Self { inner, limit_ms }
    }

    pub fn base(&self) -> &PgDriver {
        &self.inner
    }

    pub fn statement_timeout_ms(&self) -> u64 {
        self.limit_ms
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
        let checked = check_sql(sql, false)?;
        verify_relation_access(&self.inner, &checked.relations).await?;
        let mut tx = self.inner.pool().begin().await?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", self.limit_ms))
            .execute(&mut *tx)
            .await
            .map_err(|e| DbaError::from_sqlx(e, self.limit_ms))?;
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| DbaError::from_sqlx(e, self.limit_ms))?;
        tx.commit()
            .await
            .map_err(|e| DbaError::from_sqlx(e, self.limit_ms))?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}

/// Validate one SQL string for restricted execution.
///
/// Rejections are structured: parse failures are `SqlSyntax` (or
/// `UnsupportedSyntaxForRestrictedMode` when the input carries syntax the
/// parser is known to trail the server on), everything else is
/// `StatementNotAllowed` naming the offending node. The returned relation
/// list must still pass [`verify_relation_access`] before execution.
pub fn check_sql(sql: &str, allow_analyze: bool) -> Result<CheckedStatement> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|err| classify_parse_failure(sql, &err.to_string()))?;

    match statements.len() {
        0 => Err(DbaError::SqlSyntax {
            message: "empty statement".into(),
        }),
        1 => {
            let mut ctx = WalkContext::default();
            let kind = check_statement(&statements[0], allow_analyze, &mut ctx)?;
            Ok(CheckedStatement {
                kind,
                relations: ctx.relations,
            })
        }
        _ => Err(not_allowed("MultiStatement")),
    }
}

/// Positive schema allowlist, resolved against the live catalog: a
/// referenced relation may live in `pg_catalog`, `information_schema`, or
/// a schema the connected role owns. Qualified references into any other
/// schema are rejected outright; unqualified references are resolved
/// through `search_path` and rejected when they land outside the allowed
/// set. Names that resolve to nothing fall through to the server, which
/// reports them as undefined.
pub(crate) async fn verify_relation_access(
    driver: &PgDriver,
    relations: &[RelationRef],
) -> Result<()> {
    if relations.is_empty() {
        return Ok(());
    }
    let allowed = fetch_allowed_schemas(driver).await?;
    let mut resolved: HashMap<String, String> = HashMap::new();
    for relation in relations {
        if relation.schema.is_none() && !resolved.contains_key(&relation.name) {
            if let Some(schema) = resolve_unqualified(driver, &relation.name).await? {
                resolved.insert(relation.name.clone(), schema);
            }
        }
    }
    if let Some(offender) = find_schema_violation(relations, &allowed, &resolved) {
        return Err(not_allowed(offender));
    }
    Ok(())
}

async fn fetch_allowed_schemas(driver: &PgDriver) -> Result<HashSet<String>> {
    const QUERY: &str = r#"
        SELECT nspname
        FROM pg_namespace
        WHERE nspname IN ('pg_catalog', 'information_schema')
           OR pg_get_userbyid(nspowner) = current_user
    "#;
    let rows = driver.execute(QUERY, &[]).await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.as_str("nspname").map(str::to_lowercase))
        .collect())
}

async fn resolve_unqualified(driver: &PgDriver, name: &str) -> Result<Option<String>> {
    let quoted = format!("\"{}\"", name.replace('"', "\"\""));
    let rows = driver
        .execute(
            r#"
            SELECT n.nspname
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.oid = to_regclass($1)
            "#,
            &[json!(quoted)],
        )
        .await?;
    Ok(rows
        .first()
        .and_then(|row| row.as_str("nspname"))
        .map(str::to_lowercase))
}

fn find_schema_violation(
    relations: &[RelationRef],
    allowed: &HashSet<String>,
    resolved: &HashMap<String, String>,
) -> Option<String> {
    for relation in relations {
        match &relation.schema {
            Some(schema) => {
                if !allowed.contains(&schema.to_lowercase()) {
                    return Some(format!("relation {}.{}", schema, relation.name));
                }
            }
            None => {
                if let Some(schema) = resolved.get(&relation.name) {
                    if !allowed.contains(schema) {
                        return Some(format!("relation {}.{}", schema, relation.name));
                    }
                }
            }
        }
    }
    None
}

fn classify_parse_failure(sql: &str, parse_error: &str) -> DbaError {
    let upper = sql.to_uppercase();
    for marker in NEWER_SYNTAX_MARKERS {
        if upper.contains(marker) {
            return DbaError::UnsupportedSyntaxForRestrictedMode {
                construct: (*marker).to_string(),
            };
        }
    }
    DbaError::SqlSyntax {
        message: parse_error.to_string(),
    }
}

/// Accumulates the base relations a statement touches and the CTE names
/// that shadow them while the whitelist walk runs.
#[derive(Default)]
struct WalkContext {
    relations: Vec<RelationRef>,
    cte_names: HashSet<String>,
}

fn check_statement(
    statement: &Statement,
    allow_analyze: bool,
    ctx: &mut WalkContext,
) -> Result<StatementKind> {
    match statement {
        Statement::Query(query) => {
            walk_query(query, ctx)?;
            Ok(StatementKind::Select)
        }
        Statement::Explain {
            analyze, statement, ..
        } => {
            if *analyze && !allow_analyze {
                return Err(not_allowed("ExplainAnalyze"));
            }
            check_statement(statement, false, ctx)?;
            Ok(if *analyze {
                StatementKind::ExplainAnalyze
            } else {
                StatementKind::Explain
            })
        }
        Statement::ShowVariable { .. } => Ok(StatementKind::Show),
        other => Err(not_allowed(statement_node_name(other))),
    }
}

/// Offending-node names in PostgreSQL parse-node vocabulary.
fn statement_node_name(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "InsertStmt",
        Statement::Update { .. } => "UpdateStmt",
        Statement::Delete { .. } => "DeleteStmt",
        Statement::Drop { .. } => "DropStmt",
        Statement::Truncate { .. } => "TruncateStmt",
        Statement::CreateTable { .. } => "CreateStmt",
        Statement::CreateIndex { .. } => "IndexStmt",
        Statement::CreateView { .. } => "ViewStmt",
        Statement::CreateSchema { .. } => "CreateSchemaStmt",
        Statement::AlterTable { .. } | Statement::AlterIndex { .. } => "AlterTableStmt",
        Statement::Copy { .. } => "CopyStmt",
        Statement::Grant { .. } | Statement::Revoke { .. } => "GrantStmt",
        Statement::SetVariable { .. } => "VariableSetStmt",
        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. } => "TransactionStmt",
        Statement::Prepare { .. } => "PrepareStmt",
        Statement::Execute { .. } => "ExecuteStmt",
        Statement::Deallocate { .. } => "DeallocateStmt",
        Statement::Analyze { .. } => "VacuumStmt",
        Statement::Declare { .. } => "DeclareCursorStmt",
        Statement::Merge { .. } => "MergeStmt",
        _ => "Statement",
    }
}

fn not_allowed(node: impl Into<String>) -> DbaError {
    DbaError::StatementNotAllowed { node: node.into() }
}

fn walk_query(query: &Query, ctx: &mut WalkContext) -> Result<()> {
    let Query {
        with,
        body,
        order_by,
        limit,
        offset,
        ..
    } = query;
    if let Some(with) = with {
        // Writable CTEs (`WITH x AS (INSERT ...)`) do not parse as a
        // Query body and are rejected at the parse step.
        for cte in &with.cte_tables {
            ctx.cte_names.insert(cte.alias.name.value.to_lowercase());
        }
        for cte in &with.cte_tables {
            walk_query(&cte.query, ctx)?;
        }
    }
    walk_set_expr(body, ctx)?;
    for order in order_by {
        walk_expr(&order.expr, ctx)?;
    }
    if let Some(limit) = limit {
        walk_expr(limit, ctx)?;
    }
    if let Some(offset) = offset {
        walk_expr(&offset.value, ctx)?;
    }
    Ok(())
}

fn walk_set_expr(set_expr: &SetExpr, ctx: &mut WalkContext) -> Result<()> {
    match set_expr {
        SetExpr::Select(select) => walk_select(select, ctx),
        SetExpr::Query(query) => walk_query(query, ctx),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, ctx)?;
            walk_set_expr(right, ctx)
        }
        SetExpr::Values(values) => {
            for row in &values.rows {
                for expr in row {
                    walk_expr(expr, ctx)?;
                }
            }
            Ok(())
        }
        SetExpr::Insert(_) => Err(not_allowed("InsertStmt")),
        SetExpr::Update(_) => Err(not_allowed("UpdateStmt")),
        SetExpr::Table(_) => Ok(()),
    }
}

fn walk_select(select: &Select, ctx: &mut WalkContext) -> Result<()> {
    let Select {
        distinct,
        projection,
        into,
        from,
        selection,
        group_by,
        having,
        sort_by,
        qualify,
        ..
    } = select;
    if into.is_some() {
        return Err(not_allowed("SelectInto"));
    }
    if let Some(Distinct::On(exprs)) = distinct {
        for expr in exprs {
            walk_expr(expr, ctx)?;
        }
    }
    for item in projection {
        match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                walk_expr(expr, ctx)?
            }
            SelectItem::QualifiedWildcard(..) | SelectItem::Wildcard(_) => {}
        }
    }
    for table in from {
        walk_table_with_joins(table, ctx)?;
    }
    if let Some(expr) = selection {
        walk_expr(expr, ctx)?;
    }
    if let GroupByExpr::Expressions(exprs) = group_by {
        for expr in exprs {
            walk_expr(expr, ctx)?;
        }
    }
    if let Some(expr) = having {
        walk_expr(expr, ctx)?;
    }
    for expr in sort_by {
        walk_expr(expr, ctx)?;
    }
    if let Some(expr) = qualify {
        walk_expr(expr, ctx)?;
    }
    Ok(())
}

fn walk_table_with_joins(table: &TableWithJoins, ctx: &mut WalkContext) -> Result<()> {
    walk_table_factor(&table.relation, ctx)?;
    for join in &table.joins {
        walk_table_factor(&join.relation, ctx)?;
        match &join.join_operator {
            JoinOperator::Inner(constraint)
            | JoinOperator::LeftOuter(constraint)
            | JoinOperator::RightOuter(constraint)
            | JoinOperator::FullOuter(constraint)
            | JoinOperator::LeftSemi(constraint)
            | JoinOperator::RightSemi(constraint)
            | JoinOperator::LeftAnti(constraint)
            | JoinOperator::RightAnti(constraint) => walk_join_constraint(constraint, ctx)?,
            JoinOperator::CrossJoin => {}
            _ => return Err(not_allowed("JoinExpr")),
        }
    }
    Ok(())
}

fn walk_join_constraint(constraint: &JoinConstraint, ctx: &mut WalkContext) -> Result<()> {
    match constraint {
        JoinConstraint::On(expr) => walk_expr(expr, ctx),
        JoinConstraint::Using(_) | JoinConstraint::Natural | JoinConstraint::None => Ok(()),
    }
}

fn walk_table_factor(factor: &TableFactor, ctx: &mut WalkContext) -> Result<()> {
    match factor {
        TableFactor::Table { name, args, .. } => {
            screen_relation_name(name)?;
            if let Some(args) = args {
                // Table-valued function call, e.g. generate_series(...).
                check_function_name(name)?;
                for arg in args {
                    walk_function_arg(arg, ctx)?;
                }
            } else {
                record_relation(ctx, name);
            }
            Ok(())
        }
        TableFactor::Derived { subquery, .. } => walk_query(subquery, ctx),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => walk_table_with_joins(table_with_joins, ctx),
        TableFactor::UNNEST { array_exprs, .. } => {
            for expr in array_exprs {
                walk_expr(expr, ctx)?;
            }
            Ok(())
        }
        _ => Err(not_allowed("RangeFunction")),
    }
}

/// Static screen: toast/temp schemas and credential-bearing catalogs are
/// rejected before any catalog lookup. Everything that passes still goes
/// through the schema allowlist at execution time.
fn screen_relation_name(name: &ObjectName) -> Result<()> {
    let parts = &name.0;
    let relation = parts
        .last()
        .map(|ident| ident.value.to_lowercase())
        .unwrap_or_default();
    let schema = if parts.len() >= 2 {
        Some(parts[parts.len() - 2].value.to_lowercase())
    } else {
        None
    };
    if let Some(schema) = &schema {
        if schema.starts_with("pg_toast") || schema.starts_with("pg_temp") {
            return Err(not_allowed(format!("relation {name}")));
        }
    }
    // Unqualified names hit pg_catalog first on any default search_path.
    let in_catalog = schema.as_deref().map(|s| s == "pg_catalog").unwrap_or(true);
    if in_catalog && PROTECTED_CATALOG_RELATIONS.contains(&relation.as_str()) {
        return Err(not_allowed(format!("relation {name}")));
    }
    Ok(())
}

fn record_relation(ctx: &mut WalkContext, name: &ObjectName) {
    let parts = &name.0;
    let Some(last) = parts.last() else {
        return;
    };
    let relation_name = normalize_ident(last);
    let schema = if parts.len() >= 2 {
        Some(normalize_ident(&parts[parts.len() - 2]))
    } else {
        None
    };
    if schema.is_none() && ctx.cte_names.contains(&relation_name.to_lowercase()) {
        return;
    }
    let relation = RelationRef {
        schema,
        name: relation_name,
    };
    if !ctx.relations.contains(&relation) {
        ctx.relations.push(relation);
    }
}

/// Unquoted identifiers fold to lowercase, like the server does.
fn normalize_ident(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

fn walk_expr(expr: &Expr, ctx: &mut WalkContext) -> Result<()> {
    match expr {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) | Expr::Value(_) => Ok(()),
        Expr::TypedString { .. } => Ok(()),
        Expr::IsNull(e)
        | Expr::IsNotNull(e)
        | Expr::IsTrue(e)
        | Expr::IsNotTrue(e)
        | Expr::IsFalse(e)
        | Expr::IsNotFalse(e)
        | Expr::IsUnknown(e)
        | Expr::IsNotUnknown(e) => walk_expr(e, ctx),
        Expr::IsDistinctFrom(a, b) | Expr::IsNotDistinctFrom(a, b) => {
            walk_expr(a, ctx)?;
            walk_expr(b, ctx)
        }
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, ctx)?;
            walk_expr(right, ctx)
        }
        Expr::UnaryOp { expr, .. } => walk_expr(expr, ctx),
        Expr::Nested(e) => walk_expr(e, ctx),
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, ctx)?;
            for item in list {
                walk_expr(item, ctx)?;
            }
            Ok(())
        }
        Expr::InSubquery { expr, subquery, .. } => {
            walk_expr(expr, ctx)?;
            walk_query(subquery, ctx)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, ctx)?;
            walk_expr(low, ctx)?;
            walk_expr(high, ctx)
        }
        Expr::Like { expr, pattern, .. }
        | Expr::ILike { expr, pattern, .. }
        | Expr::SimilarTo { expr, pattern, .. } => {
            walk_expr(expr, ctx)?;
            walk_expr(pattern, ctx)
        }
        Expr::AnyOp { left, right, .. } | Expr::AllOp { left, right, .. } => {
            walk_expr(left, ctx)?;
            walk_expr(right, ctx)
        }
        Expr::Cast { expr, .. } | Expr::TryCast { expr, .. } | Expr::SafeCast { expr, .. } => {
            walk_expr(expr, ctx)
        }
        Expr::AtTimeZone { timestamp, .. } => walk_expr(timestamp, ctx),
        Expr::Extract { expr, .. } => walk_expr(expr, ctx),
        Expr::Ceil { expr, .. } | Expr::Floor { expr, .. } => walk_expr(expr, ctx),
        Expr::Position { expr, r#in } => {
            walk_expr(expr, ctx)?;
            walk_expr(r#in, ctx)
        }
        Expr::Substring {
            expr,
            substring_from,
            substring_for,
            ..
        } => {
            walk_expr(expr, ctx)?;
            if let Some(from) = substring_from {
                walk_expr(from, ctx)?;
            }
            if let Some(length) = substring_for {
                walk_expr(length, ctx)?;
            }
            Ok(())
        }
        Expr::Trim {
            expr, trim_what, ..
        } => {
            walk_expr(expr, ctx)?;
            if let Some(what) = trim_what {
                walk_expr(what, ctx)?;
            }
            Ok(())
        }
        Expr::Overlay {
            expr,
            overlay_what,
            overlay_from,
            overlay_for,
            ..
        } => {
            walk_expr(expr, ctx)?;
            walk_expr(overlay_what, ctx)?;
            walk_expr(overlay_from, ctx)?;
            if let Some(length) = overlay_for {
                walk_expr(length, ctx)?;
            }
            Ok(())
        }
        Expr::Collate { expr, .. } => walk_expr(expr, ctx),
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
            ..
        } => {
            if let Some(operand) = operand {
                walk_expr(operand, ctx)?;
            }
            for condition in conditions {
                walk_expr(condition, ctx)?;
            }
            for result in results {
                walk_expr(result, ctx)?;
            }
            if let Some(else_result) = else_result {
                walk_expr(else_result, ctx)?;
            }
            Ok(())
        }
        Expr::Exists { subquery, .. } => walk_query(subquery, ctx),
        Expr::Subquery(query) | Expr::ArraySubquery(query) => walk_query(query, ctx),
        Expr::Tuple(exprs) => {
            for item in exprs {
                walk_expr(item, ctx)?;
            }
            Ok(())
        }
        Expr::Array(array) => {
            for item in &array.elem {
                walk_expr(item, ctx)?;
            }
            Ok(())
        }
        Expr::ArrayIndex { obj, indexes } => {
            walk_expr(obj, ctx)?;
            for index in indexes {
                walk_expr(index, ctx)?;
            }
            Ok(())
        }
        Expr::Interval(interval) => walk_expr(&interval.value, ctx),
        Expr::JsonAccess { left, right, .. } => {
            walk_expr(left, ctx)?;
            walk_expr(right, ctx)
        }
        Expr::GroupingSets(sets) | Expr::Cube(sets) | Expr::Rollup(sets) => {
            for set in sets {
                for item in set {
                    walk_expr(item, ctx)?;
                }
            }
            Ok(())
        }
        Expr::Function(func) => walk_function(func, ctx),
        other => Err(not_allowed(format!("expression `{}`", truncated(other)))),
    }
}

fn truncated(expr: &Expr) -> String {
    let text = expr.to_string();
    if text.chars().count() > 60 {
        let head: String = text.chars().take(60).collect();
        format!("{head}...")
    } else {
        text
    }
}

fn walk_function(func: &Function, ctx: &mut WalkContext) -> Result<()> {
    let Function {
        name,
        args,
        over,
        filter,
        order_by,
        ..
    } = func;
    check_function_name(name)?;
    for arg in args {
        walk_function_arg(arg, ctx)?;
    }
    if let Some(filter) = filter {
        walk_expr(filter, ctx)?;
    }
    for order in order_by {
        walk_expr(&order.expr, ctx)?;
    }
    if let Some(WindowType::WindowSpec(spec)) = over {
        walk_window_spec(spec, ctx)?;
    }
    Ok(())
}

fn walk_function_arg(arg: &FunctionArg, ctx: &mut WalkContext) -> Result<()> {
    let arg_expr = match arg {
        FunctionArg::Named { arg, .. } => arg,
        FunctionArg::Unnamed(arg) => arg,
    };
    match arg_expr {
        FunctionArgExpr::Expr(expr) => walk_expr(expr, ctx),
        FunctionArgExpr::QualifiedWildcard(_) | FunctionArgExpr::Wildcard => Ok(()),
    }
}

fn walk_window_spec(spec: &WindowSpec, ctx: &mut WalkContext) -> Result<()> {
    let WindowSpec {
        partition_by,
        order_by,
        window_frame,
        ..
    } = spec;
    for expr in partition_by {
        walk_expr(expr, ctx)?;
    }
    for order in order_by {
        walk_expr(&order.expr, ctx)?;
    }
    if let Some(frame) = window_frame {
        walk_frame_bound(&frame.start_bound, ctx)?;
        if let Some(end) = &frame.end_bound {
            walk_frame_bound(end, ctx)?;
        }
    }
    Ok(())
}

fn walk_frame_bound(bound: &WindowFrameBound, ctx: &mut WalkContext) -> Result<()> {
    match bound {
        WindowFrameBound::Preceding(Some(expr)) | WindowFrameBound::Following(Some(expr)) => {
            walk_expr(expr, ctx)
        }
        _ => Ok(()),
    }
}

fn check_function_name(name: &ObjectName) -> Result<()> {
    if name.0.len() > 1 {
        let schema = name.0[0].value.to_lowercase();
        if schema != "pg_catalog" && schema != "information_schema" && schema != "public" {
            return Err(not_allowed(format!("function {name}")));
        }
    }
    let func = name
        .0
        .last()
        .map(|ident| ident.value.to_lowercase())
        .unwrap_or_default();
    if func.starts_with("hypopg") {
        return Ok(());
    }
    if ALLOWED_FUNCTIONS.contains(&func.as_str()) {
        Ok(())
    } else {
        Err(not_allowed(format!("function {func}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn node_of(err: DbaError) -> String {
        match err {
            DbaError::StatementNotAllowed { node } => node,
            other => panic!("expected StatementNotAllowed, got {other}"),
        }
    }

    fn allowed_schemas(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case("SELECT 1")]
    #[case("SELECT * FROM orders WHERE customer_id = $1 ORDER BY created_at LIMIT 10")]
    #[case("WITH recent AS (SELECT * FROM orders WHERE created_at > now() - interval '1 day') SELECT count(*) FROM recent")]
    #[case("SELECT o.id, c.name FROM orders o JOIN customers c ON o.customer_id = c.id")]
    #[case("SELECT a FROM t1 UNION ALL SELECT b FROM t2")]
    #[case("SELECT customer_id, row_number() OVER (PARTITION BY customer_id ORDER BY created_at) FROM orders")]
    #[case("SELECT pg_get_indexdef(indexrelid) FROM pg_index")]
    #[case("SELECT * FROM hypopg_list_indexes()")]
    #[case("SELECT generate_series(1, 10)")]
    #[case("SELECT coalesce(sum(total), 0) FROM orders GROUP BY status HAVING count(*) > 1")]
    fn allows_read_only_statements(#[case] sql: &str) {
        assert_eq!(check_sql(sql, false).unwrap().kind, StatementKind::Select);
    }

    #[rstest]
    #[case("DROP TABLE t", "DropStmt")]
    #[case("INSERT INTO t VALUES (1)", "InsertStmt")]
    #[case("UPDATE t SET a = 1", "UpdateStmt")]
    #[case("DELETE FROM t", "DeleteStmt")]
    #[case("TRUNCATE t", "TruncateStmt")]
    #[case("CREATE TABLE t (id int)", "CreateStmt")]
    #[case("CREATE INDEX t_a_idx ON t (a)", "IndexStmt")]
    #[case("ALTER TABLE t ADD COLUMN b int", "AlterTableStmt")]
    #[case("SET work_mem = '1GB'", "VariableSetStmt")]
    #[case("BEGIN", "TransactionStmt")]
    fn rejects_write_statements_with_node_name(#[case] sql: &str, #[case] node: &str) {
        assert_eq!(node_of(check_sql(sql, false).unwrap_err()), node);
    }

    #[test]
    fn rejects_multiple_statements() {
        let err = check_sql("SELECT 1; SELECT 2", false).unwrap_err();
        assert_eq!(node_of(err), "MultiStatement");
    }

    #[test]
    fn rejects_unparseable_sql_as_syntax_error() {
        let err = check_sql("SELECT FROM WHERE", false).unwrap_err();
        assert!(matches!(err, DbaError::SqlSyntax { .. }));
    }

    #[test]
    fn flags_parser_lag_for_newer_json_syntax() {
        let sql = "SELECT * FROM JSON_TABLE('[]', '$[*]' COLUMNS (id int PATH '$'))";
        let err = check_sql(sql, false).unwrap_err();
        assert!(matches!(
            err,
            DbaError::UnsupportedSyntaxForRestrictedMode { .. }
        ));
    }

    #[rstest]
    #[case("SELECT pg_read_file('/etc/passwd')")]
    #[case("SELECT pg_ls_dir('.')")]
    #[case("SELECT nextval('seq')")]
    #[case("SELECT setval('seq', 10)")]
    #[case("SELECT pg_terminate_backend(123)")]
    #[case("SELECT pg_sleep(10)")]
    fn rejects_dangerous_functions(#[case] sql: &str) {
        let node = node_of(check_sql(sql, false).unwrap_err());
        assert!(node.starts_with("function "), "got {node}");
    }

    #[rstest]
    #[case("SELECT * FROM pg_toast.pg_toast_1234")]
    #[case("SELECT * FROM pg_temp.scratch")]
    #[case("SELECT passwd FROM pg_shadow")]
    #[case("SELECT rolpassword FROM pg_authid")]
    #[case("SELECT * FROM pg_catalog.pg_authid")]
    #[case("SELECT * FROM pg_user_mapping")]
    fn rejects_protected_relations_statically(#[case] sql: &str) {
        let node = node_of(check_sql(sql, false).unwrap_err());
        assert!(node.starts_with("relation "), "got {node}");
    }

    #[test]
    fn collects_base_relations_but_not_cte_aliases() {
        let sql = "WITH recent AS (SELECT * FROM orders) \
                   SELECT * FROM recent JOIN app.customers c ON c.id = recent.customer_id";
        let checked = check_sql(sql, false).unwrap();
        assert_eq!(
            checked.relations,
            vec![
                RelationRef {
                    schema: None,
                    name: "orders".into()
                },
                RelationRef {
                    schema: Some("app".into()),
                    name: "customers".into()
                },
            ]
        );
    }

    #[test]
    fn collects_relations_from_subqueries() {
        let sql = "SELECT * FROM orders WHERE customer_id IN (SELECT id FROM vip.customers)";
        let checked = check_sql(sql, false).unwrap();
        assert!(checked.relations.contains(&RelationRef {
            schema: Some("vip".into()),
            name: "customers".into()
        }));
    }

    #[test]
    fn quoted_identifiers_keep_case_and_unquoted_fold() {
        let checked = check_sql("SELECT * FROM \"Mixed\".\"Case\", plain_table", false).unwrap();
        assert_eq!(
            checked.relations,
            vec![
                RelationRef {
                    schema: Some("Mixed".into()),
                    name: "Case".into()
                },
                RelationRef {
                    schema: None,
                    name: "plain_table".into()
                },
            ]
        );
    }

    #[test]
    fn qualified_foreign_schema_is_a_violation() {
        let relations = vec![RelationRef {
            schema: Some("other_tenant_schema".into()),
            name: "secrets".into(),
        }];
        let allowed = allowed_schemas(&["pg_catalog", "information_schema", "app"]);
        let offender = find_schema_violation(&relations, &allowed, &HashMap::new());
        assert_eq!(
            offender.as_deref(),
            Some("relation other_tenant_schema.secrets")
        );
    }

    #[test]
    fn unqualified_name_resolving_into_foreign_schema_is_a_violation() {
        let relations = vec![RelationRef {
            schema: None,
            name: "secrets".into(),
        }];
        let allowed = allowed_schemas(&["pg_catalog", "information_schema", "app"]);
        let mut resolved = HashMap::new();
        resolved.insert("secrets".to_string(), "other_tenant_schema".to_string());
        let offender = find_schema_violation(&relations, &allowed, &resolved);
        assert_eq!(
            offender.as_deref(),
            Some("relation other_tenant_schema.secrets")
        );
    }

    #[test]
    fn owned_and_system_schemas_pass_the_allowlist() {
        let relations = vec![
            RelationRef {
                schema: Some("app".into()),
                name: "orders".into(),
            },
            RelationRef {
                schema: Some("pg_catalog".into()),
                name: "pg_class".into(),
            },
            RelationRef {
                schema: None,
                name: "orders".into(),
            },
        ];
        let allowed = allowed_schemas(&["pg_catalog", "information_schema", "app"]);
        let mut resolved = HashMap::new();
        resolved.insert("orders".to_string(), "app".to_string());
        assert_eq!(find_schema_violation(&relations, &allowed, &resolved), None);
    }

    #[test]
    fn unresolvable_names_fall_through_to_the_server() {
        let relations = vec![RelationRef {
            schema: None,
            name: "no_such_table".into(),
        }];
        let allowed = allowed_schemas(&["pg_catalog", "information_schema"]);
        assert_eq!(
            find_schema_violation(&relations, &allowed, &HashMap::new()),
            None
        );
    }

    #[test]
    fn explain_is_allowed_but_analyze_needs_permission() {
        assert_eq!(
            check_sql("EXPLAIN SELECT 1", false).unwrap().kind,
            StatementKind::Explain
        );
        let err = check_sql("EXPLAIN ANALYZE SELECT 1", false).unwrap_err();
        assert_eq!(node_of(err), "ExplainAnalyze");
        assert_eq!(
            check_sql("EXPLAIN ANALYZE SELECT 1", true).unwrap().kind,
            StatementKind::ExplainAnalyze
        );
    }

    #[test]
    fn show_is_allowed() {
        assert_eq!(
            check_sql("SHOW server_version_num", false).unwrap().kind,
            StatementKind::Show
        );
    }

    #[test]
    fn subqueries_are_walked_too() {
        let err = check_sql(
            "SELECT * FROM orders WHERE id IN (SELECT pg_ls_dir('.'))",
            false,
        )
        .unwrap_err();
        assert!(node_of(err).contains("pg_ls_dir"));
    }
}
