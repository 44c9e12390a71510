use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlparser::ast::{Expr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::DbaError;

/// PostgreSQL caps index width at 32 columns.
pub const MAX_INDEX_COLUMNS: usize = 32;

/// A `(schema, table)` pair. Schemas default to `public` when omitted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: Option<String>, name: impl Into<String>) -> Self {
        Self {
            schema,
            name: name.into(),
        }
    }

    pub fn schema_or_default(&self) -> &str {
        self.schema.as_deref().unwrap_or("public")
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema_or_default(), self.name)
    }

    /// Quoted, schema-qualified form for embedding in DDL.
    pub fn quoted(&self) -> String {
        format!(
            "\"{}\".\"{}\"",
            self.schema_or_default().replace('"', "\"\""),
            self.name.replace('"', "\"\"")
        )
    }
}

/// A candidate or recommended index, fully reconstructable as DDL.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct IndexDefinition {
    pub table: TableRef,
    pub columns: Vec<String>,
    #[serde(default = "default_index_method")]
    pub using: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, rename = "where")]
    pub predicate: Option<String>,
}

fn default_index_method() -> String {
    "btree".to_string()
}

impl IndexDefinition {
    pub fn btree(table: TableRef, columns: Vec<String>) -> Self {
        Self {
            table,
            columns,
            using: default_index_method(),
            unique: false,
            predicate: None,
        }
    }

    pub fn validate(&self) -> Result<(), DbaError> {
        if self.columns.is_empty() {
            return Err(DbaError::InvalidArguments {
                message: format!("index on {} has no columns", self.table.full_name()),
            });
        }
        if self.columns.len() > MAX_INDEX_COLUMNS {
            return Err(DbaError::InvalidArguments {
                message: format!(
                    "index on {} has {} columns; PostgreSQL allows at most {}",
                    self.table.full_name(),
                    self.columns.len(),
                    MAX_INDEX_COLUMNS
                ),
            });
        }
        Ok(())
    }

    /// The `CREATE INDEX` statement this definition describes.
    pub fn ddl(&self) -> String {
        let unique = if self.unique { "UNIQUE " } else { "" };
        let columns = self
            .columns
            .iter()
            .map(|c| format!("\"{}\"", c.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(", ");
        let mut ddl = format!(
            "CREATE {}INDEX ON {} USING {} ({})",
            unique,
            self.table.quoted(),
            self.using,
            columns
        );
        if let Some(predicate) = &self.predicate {
            ddl.push_str(" WHERE ");
            ddl.push_str(predicate);
        }
        ddl
    }

    /// Parse index DDL as produced by `pg_get_indexdef` (or [`Self::ddl`])
    /// back into a definition. Inverse of `ddl()` up to the index name,
    /// which PostgreSQL assigns and the definition does not carry.
    pub fn parse_ddl(ddl: &str) -> Result<Self, DbaError> {
        let (create_part, predicate) = split_predicate(ddl);
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, create_part).map_err(|e| {
            DbaError::SqlSyntax {
                message: e.to_string(),
            }
        })?;
        match statements.into_iter().next() {
            Some(Statement::CreateIndex {
                table_name,
                using,
                columns,
                unique,
                ..
            }) => {
                let parts: Vec<String> =
                    table_name.0.iter().map(|ident| ident.value.clone()).collect();
                let table = match parts.len() {
                    0 => {
                        return Err(DbaError::SqlSyntax {
                            message: "index DDL names no table".into(),
                        })
                    }
                    1 => TableRef::new(None, parts[0].clone()),
                    _ => TableRef::new(
                        Some(parts[parts.len() - 2].clone()),
                        parts[parts.len() - 1].clone(),
                    ),
                };
                let columns: Vec<String> = columns
                    .iter()
                    .filter_map(|column| match &column.expr {
                        Expr::Identifier(ident) => Some(ident.value.clone()),
                        _ => None,
                    })
                    .collect();
                let definition = Self {
                    table,
                    columns,
                    using: using
                        .map(|u| u.value.to_lowercase())
                        .unwrap_or_else(default_index_method),
                    unique,
                    predicate,
                };
                definition.validate()?;
                Ok(definition)
            }
            _ => Err(DbaError::SqlSyntax {
                message: "not a CREATE INDEX statement".into(),
            }),
        }
    }

    /// Stable identity used for dedup and candidate-interaction maps.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.table.full_name(),
            self.using,
            self.columns.join(",").to_lowercase(),
            self.predicate.as_deref().unwrap_or("")
        )
    }
}

fn split_predicate(ddl: &str) -> (&str, Option<String>) {
    let upper = ddl.to_uppercase();
    match upper.rfind(" WHERE ") {
        Some(pos) => (
            &ddl[..pos],
            Some(ddl[pos + " WHERE ".len()..].trim().to_string()),
        ),
        None => (ddl, None),
    }
}

/// One workload entry, from pg_stat_statements or supplied directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadQuery {
    pub query_text: String,
    pub calls: i64,
    pub mean_exec_ms: f64,
    pub queryid: Option<i64>,
}

impl WorkloadQuery {
    pub fn ad_hoc(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            calls: 1,
            mean_exec_ms: 0.0,
            queryid: None,
        }
    }
}

/// EXPLAIN output: the PostgreSQL JSON plan preserved verbatim, plus a
/// header derived from it. Unknown plan keys pass through untouched so
/// newer server versions keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainArtifact {
    pub server_version_num: i32,
    pub options: Vec<String>,
    pub hypothetical_indexes: Vec<IndexDefinition>,
    pub total_cost: Option<f64>,
    pub actual_total_time_ms: Option<f64>,
    /// True when parameter markers were substituted with typed nulls
    /// because the server predates EXPLAIN (GENERIC_PLAN).
    pub best_effort: bool,
    pub plan: Value,
}

/// A single advisor recommendation. `proposed_cost <= baseline_cost` holds
/// for every returned entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecommendation {
    pub definition: IndexDefinition,
    pub estimated_size_bytes: i64,
    pub baseline_cost: f64,
    pub proposed_cost: f64,
    pub affected_queries: Vec<i64>,
}

/// The advisor's result: recommendations plus search bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdvisorReport {
    pub recommendations: Vec<IndexRecommendation>,
    pub baseline_total_cost: f64,
    pub proposed_total_cost: f64,
    /// True when the wall-clock budget truncated the search and the
    /// best-so-far solution was returned.
    pub partial: bool,
    pub queries_examined: usize,
    pub queries_skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ref_defaults_to_public() {
        let t = TableRef::new(None, "orders");
        assert_eq!(t.full_name(), "public.orders");
        assert_eq!(t.quoted(), "\"public\".\"orders\"");
    }

    #[test]
    fn index_ddl_includes_method_and_predicate() {
        let def = IndexDefinition {
            table: TableRef::new(Some("app".into()), "orders"),
            columns: vec!["customer_id".into(), "created_at".into()],
            using: "btree".into(),
            unique: false,
            predicate: Some("status = 'open'".into()),
        };
        assert_eq!(
            def.ddl(),
            "CREATE INDEX ON \"app\".\"orders\" USING btree (\"customer_id\", \"created_at\") \
             WHERE status = 'open'"
        );
    }

    #[test]
    fn validate_rejects_empty_and_oversized_column_lists() {
        let empty = IndexDefinition::btree(TableRef::new(None, "t"), vec![]);
        assert!(empty.validate().is_err());

        let wide = IndexDefinition::btree(
            TableRef::new(None, "t"),
            (0..33).map(|i| format!("c{i}")).collect(),
        );
        assert!(wide.validate().is_err());
    }

    #[test]
    fn ddl_round_trips_through_pg_get_indexdef_format() {
        let def = IndexDefinition {
            table: TableRef::new(Some("public".into()), "orders"),
            columns: vec!["customer_id".into(), "created_at".into()],
            using: "btree".into(),
            unique: false,
            predicate: Some("status = 'open'".into()),
        };
        // The server normalizes to a named, qualified form.
        let server_ddl = "CREATE INDEX orders_customer_id_created_at_idx \
                          ON public.orders USING btree (customer_id, created_at) \
                          WHERE status = 'open'";
        let parsed = IndexDefinition::parse_ddl(server_ddl).expect("parse");
        assert_eq!(parsed, def);
    }

    #[test]
    fn parse_ddl_rejects_non_index_statements() {
        assert!(IndexDefinition::parse_ddl("SELECT 1").is_err());
    }

    #[test]
    fn fingerprint_ignores_column_case() {
        let a = IndexDefinition::btree(TableRef::new(None, "t"), vec!["A".into()]);
        let b = IndexDefinition::btree(TableRef::new(None, "t"), vec!["a".into()]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
