//! The MCP tool surface: nine `postgres_*` tools dispatching into the
//! analysis engine. Every tool returns a JSON envelope; errors never
//! escape as protocol failures, they become `isError` envelopes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    ErrorData as McpError,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::error;

use crate::advisor::proposer::{refinement_enabled, CandidateProposer, NoopProposer};
use crate::advisor::{self, AdvisorConfig, MAX_INLINE_QUERIES};
use crate::config::{AccessMode, ServerConfig};
use crate::db::{DbPool, Driver};
use crate::error::{DbaError, Result};
use crate::explain::{self, ExplainOptions};
use crate::health::{self, HealthType};
use crate::models::{IndexDefinition, WorkloadQuery};
use crate::top_queries::{self, TopQueryOrder, DEFAULT_RESOURCE_FRACTION};
use crate::version::VersionProbe;

/// How many statements the workload advisor pulls from pg_stat_statements.
const WORKLOAD_QUERY_LIMIT: i64 = 50;

/// Hard deadline per tool invocation. Long-running subsystems (the
/// advisor's anytime loop, statement_timeout in restricted mode) are
/// budgeted well below this, so the cooperative paths fire first.
const TOOL_DEADLINE: Duration = Duration::from_secs(120);

async fn bounded<T>(work: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(TOOL_DEADLINE, work).await {
        Ok(result) => result,
        Err(_) => Err(DbaError::QueryTimeout {
            limit_ms: TOOL_DEADLINE.as_millis() as u64,
        }),
    }
}

// ============================================================================
// Parameter types
// ============================================================================

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListObjectsParams {
    #[schemars(description = "Schema name")]
    pub schema_name: String,
    #[schemars(description = "Object type: 'table', 'view', 'sequence', or 'extension'")]
    pub object_type: Option<String>,
    #[schemars(description = "Number of objects to skip (for pagination)")]
    pub offset: Option<i64>,
    #[schemars(description = "Maximum number of objects to return (for pagination)")]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ObjectDetailsParams {
    #[schemars(description = "Schema name")]
    pub schema_name: String,
    #[schemars(description = "Object name")]
    pub object_name: String,
    #[schemars(description = "Object type: 'table', 'view', 'sequence', or 'extension'")]
    pub object_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteSqlParams {
    #[schemars(description = "SQL to run")]
    pub sql: String,
    #[schemars(description = "Optional positional parameters bound as $1, $2, ...")]
    pub params: Option<Vec<Value>>,
    #[schemars(description = "Number of rows to skip (for pagination)")]
    pub offset: Option<usize>,
    #[schemars(description = "Maximum number of rows to return (for pagination)")]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ExplainQueryParams {
    #[schemars(description = "SQL query to explain")]
    pub sql: String,
    #[schemars(description = "Optional positional parameter values for $1, $2, ...")]
    pub params: Option<Vec<Value>>,
    #[schemars(
        description = "Run the query and report real execution statistics instead of estimates"
    )]
    pub analyze: Option<bool>,
    #[schemars(description = "Include buffer usage in the plan")]
    pub buffers: Option<bool>,
    #[schemars(
        description = "Plan without parameter values (native on PostgreSQL 16+, \
                       best-effort null substitution before that)"
    )]
    pub generic_plan: Option<bool>,
    #[schemars(description = "Include planner memory usage (PostgreSQL 17+)")]
    pub memory: Option<bool>,
    #[schemars(description = "Measure result serialization; requires analyze (PostgreSQL 17+)")]
    pub serialize: Option<bool>,
    #[schemars(
        description = "Hypothetical indexes to simulate, e.g. \
                       [{\"table\": {\"name\": \"orders\"}, \"columns\": [\"customer_id\"]}]"
    )]
    pub hypothetical_indexes: Option<Vec<IndexDefinition>>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct WorkloadIndexesParams {
    #[schemars(description = "Max total size of recommended indexes in MB")]
    pub max_index_size_mb: Option<i64>,
    #[schemars(description = "Max number of recommended indexes")]
    pub max_indexes: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct QueryIndexesParams {
    #[schemars(description = "List of up to 10 SQL queries to analyze")]
    pub queries: Vec<String>,
    #[schemars(description = "Max total size of recommended indexes in MB")]
    pub max_index_size_mb: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DbHealthParams {
    #[schemars(
        description = "Health checks to run: 'all' (default) or a comma-separated subset of \
                       index, buffer, connection, replication, sequence, constraint, vacuum"
    )]
    pub health_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TopQueriesParams {
    #[schemars(
        description = "Ranking criteria: 'resources' (default), 'total_time', 'mean_time', \
                       'io_time', or 'calls'"
    )]
    pub sort_by: Option<String>,
    #[schemars(description = "Number of queries to return (max 200)")]
    pub limit: Option<i64>,
}

// ============================================================================
// Server
// ============================================================================

#[derive(Clone)]
pub struct DbaServer {
    driver: Driver,
    probe: Arc<VersionProbe>,
    access_mode: AccessMode,
    pub tool_router: ToolRouter<Self>,
}

impl DbaServer {
    pub fn new(pool: DbPool, config: &ServerConfig) -> Self {
        Self {
            driver: Driver::new(pool, config.access_mode, config.statement_timeout_ms),
            probe: Arc::new(VersionProbe::new()),
            access_mode: config.access_mode,
            tool_router: Self::tool_router(),
        }
    }

    fn proposer(&self) -> Option<&'static dyn CandidateProposer> {
        static NOOP: NoopProposer = NoopProposer;
        if refinement_enabled() {
            Some(&NOOP)
        } else {
            None
        }
    }
}

fn text_response<T: Serialize>(payload: &T) -> CallToolResult {
    match serde_json::to_string_pretty(payload) {
        Ok(text) => CallToolResult::success(vec![Content::text(text)]),
        Err(err) => error_response(&DbaError::internal(format!("serialization failed: {err}"))),
    }
}

fn error_response(err: &DbaError) -> CallToolResult {
    CallToolResult::error(vec![Content::text(err.to_string())])
}

fn respond<T: Serialize>(result: Result<T>) -> CallToolResult {
    match result {
        Ok(payload) => text_response(&payload),
        Err(err) => {
            error!("Tool call failed: {err}");
            error_response(&err)
        }
    }
}

// ============================================================================
// Tools
// ============================================================================

#[rmcp::tool_router]
impl DbaServer {
    #[rmcp::tool(
        description = "List all schemas in the database",
        annotations(title = "List Schemas", read_only_hint = true, destructive_hint = false, idempotent_hint = true, open_world_hint = false)
    )]
    pub async fn postgres_list_schemas(&self) -> std::result::Result<CallToolResult, McpError> {
        let result = bounded(
            self.driver
                .base()
                .execute(
                r#"
                SELECT
                    schema_name,
                    schema_owner,
                    CASE
                        WHEN schema_name LIKE 'pg_%' THEN 'System Schema'
                        WHEN schema_name = 'information_schema' THEN 'System Information Schema'
                        ELSE 'User Schema'
                    END AS schema_type
                FROM information_schema.schemata
                ORDER BY schema_type, schema_name
                "#,
                    &[],
                ),
        )
        .await;
        Ok(respond(result))
    }

    #[rmcp::tool(
        description = "List objects (tables, views, sequences, or extensions) in a schema",
        annotations(title = "List Objects", read_only_hint = true, destructive_hint = false, idempotent_hint = true, open_world_hint = false)
    )]
    pub async fn postgres_list_objects(
        &self,
        Parameters(params): Parameters<ListObjectsParams>,
    ) -> std::result::Result<CallToolResult, McpError> {
        Ok(respond(bounded(self.list_objects(params)).await))
    }

    #[rmcp::tool(
        description = "Show columns, constraints, and indexes for one database object",
        annotations(title = "Get Object Details", read_only_hint = true, destructive_hint = false, idempotent_hint = true, open_world_hint = false)
    )]
    pub async fn postgres_get_object_details(
        &self,
        Parameters(params): Parameters<ObjectDetailsParams>,
    ) -> std::result::Result<CallToolResult, McpError> {
        Ok(respond(bounded(self.object_details(params)).await))
    }

    #[rmcp::tool(
        description = "Execute SQL. In unrestricted mode any SQL runs; in restricted mode \
                       statements are parsed, validated read-only, and time-bounded.",
        annotations(title = "Execute SQL", destructive_hint = true, idempotent_hint = false, open_world_hint = false)
    )]
    pub async fn postgres_execute_sql(
        &self,
        Parameters(params): Parameters<ExecuteSqlParams>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let bind = params.params.unwrap_or_default();
        let result = bounded(self.driver.execute(&params.sql, &bind))
            .await
            .map(|rows| {
                let offset = params.offset.unwrap_or(0).min(rows.len());
                let mut rows: Vec<_> = rows.into_iter().skip(offset).collect();
                if let Some(limit) = params.limit {
                    rows.truncate(limit);
                }
                rows
            });
        Ok(respond(result))
    }

    #[rmcp::tool(
        description = "Explain the execution plan for a SQL query, optionally with \
                       hypothetical indexes to see what the planner would do if they existed",
        annotations(title = "Explain Query", read_only_hint = true, destructive_hint = false, idempotent_hint = true, open_world_hint = false)
    )]
    pub async fn postgres_explain_query(
        &self,
        Parameters(params): Parameters<ExplainQueryParams>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let options = ExplainOptions {
            analyze: params.analyze.unwrap_or(false),
            buffers: params.buffers.unwrap_or(false),
            generic_plan: params.generic_plan.unwrap_or(false),
            memory: params.memory.unwrap_or(false),
            serialize: params.serialize.unwrap_or(false),
            hypothetical_indexes: params.hypothetical_indexes.unwrap_or_default(),
        };
        let bind = params.params.unwrap_or_default();
        let result = bounded(explain::explain(
            &self.driver,
            &self.probe,
            &params.sql,
            &bind,
            &options,
        ))
        .await;
        Ok(respond(result))
    }

    #[rmcp::tool(
        description = "Analyze frequently executed queries from pg_stat_statements and \
                       recommend optimal indexes",
        annotations(title = "Analyze Workload Indexes", read_only_hint = true, destructive_hint = false, idempotent_hint = true, open_world_hint = false)
    )]
    pub async fn postgres_analyze_workload_indexes(
        &self,
        Parameters(params): Parameters<WorkloadIndexesParams>,
    ) -> std::result::Result<CallToolResult, McpError> {
        Ok(respond(bounded(self.workload_indexes(params)).await))
    }

    #[rmcp::tool(
        description = "Analyze a list of (up to 10) SQL queries and recommend optimal indexes",
        annotations(title = "Analyze Query Indexes", read_only_hint = true, destructive_hint = false, idempotent_hint = true, open_world_hint = false)
    )]
    pub async fn postgres_analyze_query_indexes(
        &self,
        Parameters(params): Parameters<QueryIndexesParams>,
    ) -> std::result::Result<CallToolResult, McpError> {
        Ok(respond(bounded(self.query_indexes(params)).await))
    }

    #[rmcp::tool(
        description = "Analyze database health: index, buffer, connection, replication, \
                       sequence, constraint, and vacuum checks",
        annotations(title = "Analyze Database Health", read_only_hint = true, destructive_hint = false, idempotent_hint = true, open_world_hint = false)
    )]
    pub async fn postgres_analyze_db_health(
        &self,
        Parameters(params): Parameters<DbHealthParams>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let selection = params.health_type.unwrap_or_else(|| "all".into());
        let result = match HealthType::parse_list(&selection) {
            Ok(types) => {
                bounded(async { Ok(health::run_checks(&self.driver, &self.probe, &types).await) })
                    .await
            }
            Err(err) => Err(err),
        };
        Ok(respond(result))
    }

    #[rmcp::tool(
        description = "Report the slowest or most resource-intensive queries using \
                       pg_stat_statements",
        annotations(title = "Get Top Queries", read_only_hint = true, destructive_hint = false, idempotent_hint = true, open_world_hint = false)
    )]
    pub async fn postgres_get_top_queries(
        &self,
        Parameters(params): Parameters<TopQueriesParams>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let sort_by = params.sort_by.unwrap_or_else(|| "resources".into());
        let limit = params.limit.unwrap_or(10);
        let result = if sort_by == "resources" {
            bounded(top_queries::resource_queries(
                &self.driver,
                &self.probe,
                DEFAULT_RESOURCE_FRACTION,
            ))
            .await
        } else {
            match TopQueryOrder::parse(&sort_by) {
                Ok(order) => {
                    bounded(top_queries::top_queries(
                        &self.driver,
                        &self.probe,
                        order,
                        limit,
                    ))
                    .await
                }
                Err(err) => Err(err),
            }
        };
        Ok(respond(result))
    }
}

// ============================================================================
// Tool bodies
// ============================================================================

impl DbaServer {
    async fn list_objects(&self, params: ListObjectsParams) -> Result<Vec<Value>> {
        let object_type = params.object_type.as_deref().unwrap_or("table");
        let limit = json!(params.limit.unwrap_or(i64::MAX));
        let offset = json!(params.offset.unwrap_or(0));
        match object_type {
            "table" | "view" => {
                let table_type = if object_type == "table" {
                    "BASE TABLE"
                } else {
                    "VIEW"
                };
                let rows = self
                    .driver
                    .base()
                    .execute(
                        r#"
                        SELECT table_schema, table_name, table_type
                        FROM information_schema.tables
                        WHERE table_schema = $1 AND table_type = $2
                        ORDER BY table_name
                        LIMIT $3 OFFSET $4
                        "#,
                        &[
                            json!(params.schema_name),
                            json!(table_type),
                            limit,
                            offset,
                        ],
                    )
                    .await?;
                Ok(rows
                    .iter()
                    .map(|row| {
                        json!({
                            "schema": row.get("table_schema"),
                            "name": row.get("table_name"),
                            "type": row.get("table_type"),
                        })
                    })
                    .collect())
            }
            "sequence" => {
                let rows = self
                    .driver
                    .base()
                    .execute(
                        r#"
                        SELECT sequence_schema, sequence_name, data_type
                        FROM information_schema.sequences
                        WHERE sequence_schema = $1
                        ORDER BY sequence_name
                        LIMIT $2 OFFSET $3
                        "#,
                        &[json!(params.schema_name), limit, offset],
                    )
                    .await?;
                Ok(rows
                    .iter()
                    .map(|row| {
                        json!({
                            "schema": row.get("sequence_schema"),
                            "name": row.get("sequence_name"),
                            "data_type": row.get("data_type"),
                        })
                    })
                    .collect())
            }
            "extension" => {
                let rows = self
                    .driver
                    .base()
                    .execute(
                        r#"
                        SELECT extname, extversion, extrelocatable
                        FROM pg_extension
                        ORDER BY extname
                        LIMIT $1 OFFSET $2
                        "#,
                        &[limit, offset],
                    )
                    .await?;
                Ok(rows
                    .iter()
                    .map(|row| {
                        json!({
                            "name": row.get("extname"),
                            "version": row.get("extversion"),
                            "relocatable": row.get("extrelocatable"),
                        })
                    })
                    .collect())
            }
            other => Err(DbaError::InvalidArguments {
                message: format!("unsupported object type: {other}"),
            }),
        }
    }

    async fn object_details(&self, params: ObjectDetailsParams) -> Result<Value> {
        let object_type = params.object_type.as_deref().unwrap_or("table");
        match object_type {
            "table" | "view" => self.relation_details(&params).await,
            "sequence" => {
                let rows = self
                    .driver
                    .base()
                    .execute(
                        r#"
                        SELECT sequence_schema, sequence_name, data_type, start_value, increment
                        FROM information_schema.sequences
                        WHERE sequence_schema = $1 AND sequence_name = $2
                        "#,
                        &[json!(params.schema_name), json!(params.object_name)],
                    )
                    .await?;
                let row = rows.first().ok_or_else(|| DbaError::ObjectNotFound {
                    object: format!("{}.{}", params.schema_name, params.object_name),
                })?;
                Ok(json!({
                    "schema": row.get("sequence_schema"),
                    "name": row.get("sequence_name"),
                    "data_type": row.get("data_type"),
                    "start_value": row.get("start_value"),
                    "increment": row.get("increment"),
                }))
            }
            "extension" => {
                let rows = self
                    .driver
                    .base()
                    .execute(
                        r#"
                        SELECT extname, extversion, extrelocatable
                        FROM pg_extension
                        WHERE extname = $1
                        "#,
                        &[json!(params.object_name)],
                    )
                    .await?;
                let row = rows.first().ok_or_else(|| DbaError::ObjectNotFound {
                    object: params.object_name.clone(),
                })?;
                Ok(json!({
                    "name": row.get("extname"),
                    "version": row.get("extversion"),
                    "relocatable": row.get("extrelocatable"),
                }))
            }
            other => Err(DbaError::InvalidArguments {
                message: format!("unsupported object type: {other}"),
            }),
        }
    }

    async fn relation_details(&self, params: &ObjectDetailsParams) -> Result<Value> {
        let schema = json!(params.schema_name);
        let name = json!(params.object_name);
        let driver = self.driver.base();

        let columns = driver
            .execute(
                r#"
                SELECT
                    column_name,
                    data_type,
                    is_nullable,
                    column_default,
                    is_generated,
                    generation_expression
                FROM information_schema.columns
                WHERE table_schema = $1 AND table_name = $2
                ORDER BY ordinal_position
                "#,
                &[schema.clone(), name.clone()],
            )
            .await?;
        if columns.is_empty() {
            return Err(DbaError::ObjectNotFound {
                object: format!("{}.{}", params.schema_name, params.object_name),
            });
        }

        let constraint_columns = driver
            .execute(
                r#"
                SELECT tc.constraint_name, tc.constraint_type, kcu.column_name
                FROM information_schema.table_constraints AS tc
                LEFT JOIN information_schema.key_column_usage AS kcu
                  ON tc.constraint_name = kcu.constraint_name
                 AND tc.table_schema = kcu.table_schema
                WHERE tc.table_schema = $1 AND tc.table_name = $2
                "#,
                &[schema.clone(), name.clone()],
            )
            .await?;

        // Validation/enforcement flags come from pg_constraint; conenforced
        // exists from PG 18.
        let has_conenforced = self
            .probe
            .has_column(driver, "pg_catalog", "pg_constraint", "conenforced")
            .await?;
        let enforced_select = if has_conenforced {
            "con.conenforced AS is_enforced"
        } else {
            "TRUE AS is_enforced"
        };
        let meta_rows = driver
            .execute(
                &format!(
                    r#"
                    SELECT
                        con.conname AS constraint_name,
                        con.convalidated AS is_validated,
                        {enforced_select}
                    FROM pg_catalog.pg_constraint con
                    INNER JOIN pg_catalog.pg_class rel ON rel.oid = con.conrelid
                    INNER JOIN pg_catalog.pg_namespace nsp ON nsp.oid = rel.relnamespace
                    WHERE nsp.nspname = $1 AND rel.relname = $2
                    "#
                ),
                &[schema.clone(), name.clone()],
            )
            .await?;

        let mut constraints: Map<String, Value> = Map::new();
        for row in &constraint_columns {
            let Some(cname) = row.as_str("constraint_name") else {
                continue;
            };
            let entry = constraints.entry(cname.to_string()).or_insert_with(|| {
                json!({
                    "type": row.get("constraint_type"),
                    "columns": [],
                })
            });
            if let Some(column) = row.as_str("column_name") {
                if let Some(cols) = entry.get_mut("columns").and_then(Value::as_array_mut) {
                    cols.push(json!(column));
                }
            }
        }
        for row in &meta_rows {
            let Some(cname) = row.as_str("constraint_name") else {
                continue;
            };
            if let Some(entry) = constraints.get_mut(cname).and_then(Value::as_object_mut) {
                entry.insert("is_validated".into(), row.get("is_validated").cloned().unwrap_or(Value::Null));
                if has_conenforced {
                    entry.insert("is_enforced".into(), row.get("is_enforced").cloned().unwrap_or(Value::Null));
                }
            }
        }
        let constraints_list: Vec<Value> = constraints
            .into_iter()
            .map(|(cname, data)| {
                let mut object = Map::new();
                object.insert("name".into(), json!(cname));
                if let Value::Object(fields) = data {
                    object.extend(fields);
                }
                Value::Object(object)
            })
            .collect();

        let indexes = driver
            .execute(
                r#"
                SELECT indexname, indexdef
                FROM pg_indexes
                WHERE schemaname = $1 AND tablename = $2
                "#,
                &[schema, name],
            )
            .await?;
        let index_list: Vec<Value> = indexes
            .iter()
            .map(|row| {
                json!({
                    "name": row.get("indexname"),
                    "definition": row.get("indexdef"),
                })
            })
            .collect();

        Ok(json!({
            "basic": {
                "schema": params.schema_name,
                "name": params.object_name,
                "type": params.object_type.as_deref().unwrap_or("table"),
            },
            "columns": columns,
            "constraints": constraints_list,
            "indexes": index_list,
        }))
    }

    async fn workload_indexes(
        &self,
        params: WorkloadIndexesParams,
    ) -> Result<crate::models::AdvisorReport> {
        let workload = top_queries::workload_from_statements(
            &self.driver,
            &self.probe,
            WORKLOAD_QUERY_LIMIT,
        )
        .await?;
        let mut config = AdvisorConfig::default();
        if let Some(max_size_mb) = params.max_index_size_mb {
            config = config.with_max_size_mb(max_size_mb);
        }
        if let Some(max_indexes) = params.max_indexes {
            config.max_indexes = max_indexes;
        }
        advisor::analyze_workload(
            &self.driver,
            &self.probe,
            &workload,
            &config,
            self.proposer(),
        )
        .await
    }

    async fn query_indexes(
        &self,
        params: QueryIndexesParams,
    ) -> Result<crate::models::AdvisorReport> {
        if params.queries.is_empty() {
            return Err(DbaError::InvalidArguments {
                message: "provide a non-empty list of queries to analyze".into(),
            });
        }
        if params.queries.len() > MAX_INLINE_QUERIES {
            return Err(DbaError::InvalidArguments {
                message: format!("provide at most {MAX_INLINE_QUERIES} queries to analyze"),
            });
        }
        let workload: Vec<WorkloadQuery> = params
            .queries
            .iter()
            .map(|query| WorkloadQuery::ad_hoc(query.as_str()))
            .collect();
        let mut config = AdvisorConfig::default();
        if let Some(max_size_mb) = params.max_index_size_mb {
            config = config.with_max_size_mb(max_size_mb);
        }
        advisor::analyze_workload(
            &self.driver,
            &self.probe,
            &workload,
            &config,
            self.proposer(),
        )
        .await
    }
}

#[rmcp::tool_handler]
impl ServerHandler for DbaServer {
    fn get_info(&self) -> ServerInfo {
        InitializeResult {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: None }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "pgdba-mcp".to_string(),
                title: Some("PostgreSQL DBA MCP Server".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "PostgreSQL DBA tools: schema inspection, SQL execution ({} mode), \
                 EXPLAIN with hypothetical indexes, index tuning, and health checks.",
                self.access_mode.as_str()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelopes_are_flagged() {
        let envelope = error_response(&DbaError::StatementNotAllowed {
            node: "DropStmt".into(),
        });
        assert_eq!(envelope.is_error, Some(true));
    }

    #[test]
    fn payloads_serialize_with_two_space_indent() {
        let envelope = text_response(&json!({"a": 1}));
        assert_eq!(envelope.is_error, Some(false));
        let Some(raw) = envelope.content[0].as_text() else {
            panic!("expected text content");
        };
        assert!(raw.text.contains("\n  \"a\": 1"));
    }
}
