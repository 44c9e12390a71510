//! Candidate index enumeration for the advisor.
//!
//! Single-column candidates come from every column seen in an equality
//! predicate, range predicate, join key, or ORDER BY. Multi-column
//! candidates are prefixes of the per-table column pool ordered equality
//! first, then range, then order-by. Candidates already covered by a real
//! index are discarded, except on PostgreSQL 18+ where skip scan can still
//! make them useful: those are kept but demoted in the ranking.

use std::collections::HashMap;

use tracing::debug;

use crate::db::PgDriver;
use crate::error::Result;
use crate::models::{IndexDefinition, TableRef, WorkloadQuery};

use super::query_parser::{parse_column_usage, TableUsage};

const SKIP_SCAN_MAJOR: i32 = 18;

/// Real indexes present in the database, keyed by schema-qualified table.
#[derive(Debug, Default)]
pub struct IndexCatalog {
    pub indexes_by_table: HashMap<String, Vec<Vec<String>>>,
    pub schemas_by_table: HashMap<String, Vec<String>>,
}

pub async fn fetch_index_catalog(driver: &PgDriver) -> Result<IndexCatalog> {
    const QUERY: &str = r#"
        SELECT
            n.nspname AS schema_name,
            c.relname AS table_name,
            array_agg(a.attname ORDER BY arr.ord) AS columns
        FROM pg_index i
        JOIN pg_class c ON c.oid = i.indrelid
        JOIN pg_class idx ON idx.oid = i.indexrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN LATERAL unnest(i.indkey) WITH ORDINALITY AS arr(attnum, ord)
            ON arr.attnum > 0
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = arr.attnum
        WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
        GROUP BY n.nspname, c.relname, idx.relname
    "#;

    let rows = driver.execute(QUERY, &[]).await?;
    let mut catalog = IndexCatalog::default();
    for row in rows {
        let Some(schema) = row.as_str("schema_name") else {
            continue;
        };
        let Some(table) = row.as_str("table_name") else {
            continue;
        };
        let columns: Vec<String> = row
            .get("columns")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let full_name = format!("{schema}.{table}");
        catalog
            .indexes_by_table
            .entry(full_name)
            .or_default()
            .push(columns);

        let entry = catalog
            .schemas_by_table
            .entry(table.to_string())
            .or_default();
        if !entry.contains(&schema.to_string()) {
            entry.push(schema.to_string());
        }
    }

    Ok(catalog)
}

/// A candidate with the workload queries that motivated it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub definition: IndexDefinition,
    /// Indices into the workload slice.
    pub query_indices: Vec<usize>,
    /// Covered by an existing index prefix, kept only for skip-scan.
    pub demoted: bool,
}

#[derive(Debug, Default)]
pub struct GeneratedCandidates {
    pub candidates: Vec<Candidate>,
    pub parse_failures: usize,
}

pub fn generate(
    workload: &[WorkloadQuery],
    catalog: &IndexCatalog,
    server_major: i32,
    max_columns: usize,
) -> GeneratedCandidates {
    let mut out = GeneratedCandidates::default();
    let mut by_fingerprint: HashMap<String, Candidate> = HashMap::new();

    for (query_index, query) in workload.iter().enumerate() {
        let usage = match parse_column_usage(&query.query_text) {
            Ok(usage) => usage,
            Err(err) => {
                debug!("Skipping unparseable workload query: {err}");
                out.parse_failures += 1;
                continue;
            }
        };

        for (table_name, table_usage) in &usage.by_table {
            let table = resolve_table(table_name, catalog);
            for columns in column_sets(table_usage, max_columns) {
                let definition = IndexDefinition::btree(table.clone(), columns);
                let covered = is_covered_by_existing(&table.full_name(), &definition, catalog);
                if covered && server_major < SKIP_SCAN_MAJOR {
                    continue;
                }
                let fingerprint = definition.fingerprint();
                let entry = by_fingerprint
                    .entry(fingerprint)
                    .or_insert_with(|| Candidate {
                        definition,
                        query_indices: Vec::new(),
                        demoted: covered,
                    });
                if !entry.query_indices.contains(&query_index) {
                    entry.query_indices.push(query_index);
                }
            }
        }
    }

    out.candidates = by_fingerprint.into_values().collect();
    out.candidates
        .sort_by(|a, b| a.definition.fingerprint().cmp(&b.definition.fingerprint()));
    out
}

/// Ordered column sets for one table: singles for every referenced
/// column, then prefixes of the equality-range-order pool.
fn column_sets(usage: &TableUsage, max_columns: usize) -> Vec<Vec<String>> {
    let mut pool: Vec<String> = Vec::new();
    for column in usage.equalities.iter().chain(usage.joins.iter()) {
        push_unique(&mut pool, column);
    }
    for column in &usage.ranges {
        push_unique(&mut pool, column);
    }
    for column in &usage.orders {
        push_unique(&mut pool, column);
    }

    let mut sets: Vec<Vec<String>> = Vec::new();
    for column in &pool {
        sets.push(vec![column.clone()]);
    }
    for width in 2..=max_columns.min(pool.len()) {
        sets.push(pool[..width].to_vec());
    }
    sets
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values
        .iter()
        .any(|existing| existing.eq_ignore_ascii_case(value))
    {
        values.push(value.to_string());
    }
}

fn resolve_table(table_name: &str, catalog: &IndexCatalog) -> TableRef {
    if let Some((schema, name)) = table_name.split_once('.') {
        // "public" may be a default the parser applied; check whether the
        // catalog places the bare table elsewhere.
        if schema == "public" && !catalog.indexes_by_table.contains_key(table_name) {
            if let Some(schemas) = catalog.schemas_by_table.get(name) {
                if schemas.len() == 1 {
                    return TableRef::new(Some(schemas[0].clone()), name);
                }
            }
        }
        return TableRef::new(Some(schema.to_string()), name);
    }
    TableRef::new(None, table_name)
}

fn is_covered_by_existing(
    table: &str,
    definition: &IndexDefinition,
    catalog: &IndexCatalog,
) -> bool {
    let Some(indexes) = catalog.indexes_by_table.get(table) else {
        return false;
    };
    let target: Vec<String> = definition
        .columns
        .iter()
        .map(|c| c.to_lowercase())
        .collect();
    for index_columns in indexes {
        let existing: Vec<String> = index_columns.iter().map(|c| c.to_lowercase()).collect();
        if existing.len() >= target.len() && existing[..target.len()] == target[..] {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(queries: &[&str]) -> Vec<WorkloadQuery> {
        queries
            .iter()
            .map(|q| WorkloadQuery {
                query_text: (*q).to_string(),
                calls: 10,
                mean_exec_ms: 1.0,
                queryid: None,
            })
            .collect()
    }

    #[test]
    fn generates_singles_and_equality_first_composites() {
        let queries = workload(&[
            "SELECT * FROM orders WHERE customer_id = $1 AND created_at > $2 ORDER BY total",
        ]);
        let generated = generate(&queries, &IndexCatalog::default(), 16, 3);
        let columns: Vec<Vec<String>> = generated
            .candidates
            .iter()
            .map(|c| c.definition.columns.clone())
            .collect();
        assert!(columns.contains(&vec!["customer_id".to_string()]));
        assert!(columns.contains(&vec!["created_at".to_string()]));
        assert!(columns.contains(&vec!["total".to_string()]));
        // Composite pool order: equality, then range, then order-by.
        assert!(columns.contains(&vec!["customer_id".to_string(), "created_at".to_string()]));
        assert!(columns.contains(&vec![
            "customer_id".to_string(),
            "created_at".to_string(),
            "total".to_string()
        ]));
    }

    #[test]
    fn discards_candidates_covered_by_existing_prefix() {
        let queries = workload(&["SELECT * FROM orders WHERE customer_id = $1"]);
        let mut catalog = IndexCatalog::default();
        catalog.indexes_by_table.insert(
            "public.orders".into(),
            vec![vec!["customer_id".into(), "status".into()]],
        );
        let generated = generate(&queries, &catalog, 16, 3);
        assert!(generated.candidates.is_empty());
    }

    #[test]
    fn keeps_covered_candidates_demoted_on_pg18() {
        let queries = workload(&["SELECT * FROM orders WHERE customer_id = $1"]);
        let mut catalog = IndexCatalog::default();
        catalog.indexes_by_table.insert(
            "public.orders".into(),
            vec![vec!["customer_id".into(), "status".into()]],
        );
        let generated = generate(&queries, &catalog, 18, 3);
        assert_eq!(generated.candidates.len(), 1);
        assert!(generated.candidates[0].demoted);
    }

    #[test]
    fn merges_duplicate_candidates_across_queries() {
        let queries = workload(&[
            "SELECT * FROM orders WHERE customer_id = $1",
            "SELECT id FROM orders WHERE customer_id = $1",
        ]);
        let generated = generate(&queries, &IndexCatalog::default(), 16, 3);
        assert_eq!(generated.candidates.len(), 1);
        assert_eq!(generated.candidates[0].query_indices, vec![0, 1]);
    }

    #[test]
    fn counts_parse_failures_without_aborting() {
        let queries = workload(&["VACUUM orders", "SELECT * FROM orders WHERE a = 1"]);
        let generated = generate(&queries, &IndexCatalog::default(), 16, 3);
        assert_eq!(generated.parse_failures, 1);
        assert!(!generated.candidates.is_empty());
    }
}
