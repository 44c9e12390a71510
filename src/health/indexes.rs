use std::collections::HashMap;

use crate::db::PgDriver;
use crate::error::Result;
use crate::version::VersionProbe;

use super::{Finding, HealthReport, HealthType};

const MIN_REPORTED_SIZE_BYTES: i64 = 5 * 1024 * 1024;
const BLOAT_MIN_PAGES: i64 = 128;
const BLOAT_RATIO_WARN: f64 = 2.0;
const BLOAT_RATIO_CRITICAL: f64 = 4.0;
// Rough btree entry footprint: item pointer + tuple header + key bytes,
// against an 8 KB page at default fillfactor.
const ESTIMATED_ENTRY_BYTES: f64 = 40.0;
const USABLE_PAGE_BYTES: f64 = 8192.0 * 0.9;

#[derive(Debug, Clone)]
struct IndexStatRow {
    schema: String,
    table_name: String,
    index_name: String,
    columns: String,
    /// Per-key-column operator classes, in key order. Two indexes on the
    /// same columns with different opclasses (text_ops vs.
    /// text_pattern_ops) serve different queries and are not duplicates.
    operator_classes: String,
    method: String,
    size_bytes: i64,
    idx_scan: i64,
    tuples: i64,
    pages: i64,
    is_valid: bool,
    is_unique: bool,
    enforces_constraint: bool,
}

impl IndexStatRow {
    fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.index_name)
    }

    /// Pages the entry count should need; the heuristic stands in when
    /// pgstattuple is not installed.
    fn expected_pages(&self) -> f64 {
        (self.tuples as f64 * ESTIMATED_ENTRY_BYTES / USABLE_PAGE_BYTES).max(1.0)
    }

    fn bloat_ratio(&self) -> f64 {
        self.pages as f64 / self.expected_pages()
    }
}

pub(super) async fn run(driver: &PgDriver, _probe: &VersionProbe) -> Result<HealthReport> {
    let rows = fetch_index_stats(driver).await?;
    let mut findings = Vec::new();
    findings.extend(identify_invalid(&rows));
    findings.extend(identify_unused(&rows));
    findings.extend(identify_duplicates(&rows));
    findings.extend(identify_bloated(&rows));
    if findings.is_empty() {
        findings.push(Finding::ok("No index issues found."));
    }
    Ok(HealthReport::from_findings(HealthType::Index, findings))
}

async fn fetch_index_stats(driver: &PgDriver) -> Result<Vec<IndexStatRow>> {
    const QUERY: &str = r#"
        SELECT
            n.nspname AS schema_name,
            t.relname AS table_name,
            ic.relname AS index_name,
            am.amname AS method,
            pg_relation_size(i.indexrelid) AS size_bytes,
            COALESCE(s.idx_scan, 0) AS idx_scan,
            ic.reltuples::bigint AS tuples,
            ic.relpages::bigint AS pages,
            i.indisvalid AS is_valid,
            i.indisunique AS is_unique,
            EXISTS (
                SELECT 1 FROM pg_constraint c WHERE c.conindid = i.indexrelid
            ) AS enforces_constraint,
            array_to_string(ARRAY(
                SELECT a.attname
                FROM unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord)
                JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
                WHERE k.attnum > 0
                ORDER BY k.ord
            ), ',') AS columns,
            array_to_string(ARRAY(
                SELECT op.opcname
                FROM unnest(i.indclass) WITH ORDINALITY AS oc(opclass_oid, ord)
                JOIN pg_opclass op ON op.oid = oc.opclass_oid
                ORDER BY oc.ord
            ), ',') AS operator_classes
        FROM pg_index i
        JOIN pg_class ic ON ic.oid = i.indexrelid
        JOIN pg_class t ON t.oid = i.indrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_am am ON am.oid = ic.relam
        LEFT JOIN pg_stat_user_indexes s ON s.indexrelid = i.indexrelid
        WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
    "#;

    let rows = driver.execute(QUERY, &[]).await?;
    Ok(rows
        .iter()
        .filter_map(|row| {
            Some(IndexStatRow {
                schema: row.as_str("schema_name")?.to_string(),
                table_name: row.as_str("table_name")?.to_string(),
                index_name: row.as_str("index_name")?.to_string(),
                columns: row.as_str("columns").unwrap_or_default().to_string(),
                operator_classes: row
                    .as_str("operator_classes")
                    .unwrap_or_default()
                    .to_string(),
                method: row.as_str("method").unwrap_or("btree").to_string(),
                size_bytes: row.as_i64("size_bytes").unwrap_or(0),
                idx_scan: row.as_i64("idx_scan").unwrap_or(0),
                tuples: row.as_i64("tuples").unwrap_or(0),
                pages: row.as_i64("pages").unwrap_or(0),
                is_valid: row.as_bool("is_valid").unwrap_or(true),
                is_unique: row.as_bool("is_unique").unwrap_or(false),
                enforces_constraint: row.as_bool("enforces_constraint").unwrap_or(false),
            })
        })
        .collect())
}

fn identify_invalid(rows: &[IndexStatRow]) -> Vec<Finding> {
    rows.iter()
        .filter(|row| !row.is_valid)
        .map(|row| {
            Finding::critical(format!(
                "Index {} is invalid; a concurrent build likely failed. Drop and recreate it.",
                row.qualified()
            ))
        })
        .collect()
}

fn identify_unused(rows: &[IndexStatRow]) -> Vec<Finding> {
    rows.iter()
        .filter(|row| {
            row.idx_scan == 0
                && row.size_bytes >= MIN_REPORTED_SIZE_BYTES
                && !row.is_unique
                && !row.enforces_constraint
                && row.is_valid
        })
        .map(|row| {
            Finding::warning(format!(
                "Index {} on {}.{} has never been scanned since the stats reset; \
                 dropping it would reclaim {} bytes of disk and write overhead.",
                row.qualified(),
                row.schema,
                row.table_name,
                row.size_bytes
            ))
        })
        .collect()
}

fn identify_duplicates(rows: &[IndexStatRow]) -> Vec<Finding> {
    let mut groups: HashMap<String, Vec<&IndexStatRow>> = HashMap::new();
    for row in rows {
        if row.columns.is_empty() {
            continue;
        }
        let key = format!(
            "{}.{}:{}:{}:{}",
            row.schema,
            row.table_name,
            row.method,
            row.columns.to_lowercase(),
            row.operator_classes.to_lowercase()
        );
        groups.entry(key).or_default().push(row);
    }
    let mut findings = Vec::new();
    for group in groups.values() {
        if group.len() < 2 {
            continue;
        }
        let names: Vec<String> = group.iter().map(|r| r.qualified()).collect();
        findings.push(Finding::warning(format!(
            "Indexes {} duplicate each other on {}.{} ({}; opclass {}); keep one.",
            names.join(", "),
            group[0].schema,
            group[0].table_name,
            group[0].columns,
            group[0].operator_classes
        )));
    }
    findings.sort_by(|a, b| a.message.cmp(&b.message));
    findings
}

fn identify_bloated(rows: &[IndexStatRow]) -> Vec<Finding> {
    rows.iter()
        .filter(|row| row.pages >= BLOAT_MIN_PAGES && row.tuples > 0)
        .filter_map(|row| {
            let ratio = row.bloat_ratio();
            if ratio >= BLOAT_RATIO_CRITICAL {
                Some(Finding::critical(format!(
                    "Index {} is roughly {:.1}x its expected size; REINDEX to reclaim space.",
                    row.qualified(),
                    ratio
                )))
            } else if ratio >= BLOAT_RATIO_WARN {
                Some(Finding::warning(format!(
                    "Index {} is roughly {:.1}x its expected size; consider REINDEX.",
                    row.qualified(),
                    ratio
                )))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Severity;

    fn row(name: &str, columns: &str) -> IndexStatRow {
        IndexStatRow {
            schema: "public".into(),
            table_name: "orders".into(),
            index_name: name.into(),
            columns: columns.into(),
            operator_classes: "text_ops".into(),
            method: "btree".into(),
            size_bytes: 10 * 1024 * 1024,
            idx_scan: 100,
            tuples: 100_000,
            pages: 600,
            is_valid: true,
            is_unique: false,
            enforces_constraint: false,
        }
    }

    #[test]
    fn unused_index_is_reported_unless_it_enforces_a_constraint() {
        let mut unused = row("orders_status_idx", "status");
        unused.idx_scan = 0;
        let mut pkey = row("orders_pkey", "id");
        pkey.idx_scan = 0;
        pkey.is_unique = true;
        pkey.enforces_constraint = true;

        let findings = identify_unused(&[unused, pkey]);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("orders_status_idx"));
    }

    #[test]
    fn duplicate_indexes_are_grouped_by_table_columns_and_opclass() {
        let a = row("orders_cust_idx", "customer_id");
        let b = row("orders_cust_idx2", "customer_id");
        let c = row("orders_created_idx", "created_at");
        let findings = identify_duplicates(&[a, b, c]);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("orders_cust_idx"));
        assert!(findings[0].message.contains("orders_cust_idx2"));
    }

    #[test]
    fn different_operator_classes_are_not_duplicates() {
        // The classic pairing: one index for '=' lookups, one for
        // LIKE 'foo%' prefix scans. Same method, same column.
        let equality = row("orders_email_idx", "email");
        let mut pattern = row("orders_email_pattern_idx", "email");
        pattern.operator_classes = "text_pattern_ops".into();
        assert!(identify_duplicates(&[equality, pattern]).is_empty());
    }

    #[test]
    fn invalid_index_is_critical() {
        let mut invalid = row("orders_bad_idx", "status");
        invalid.is_valid = false;
        let findings = identify_invalid(&[invalid]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn bloat_heuristic_flags_oversized_indexes() {
        // ~100k entries fit in ~550 pages; 5000 pages is ~9x.
        let mut bloated = row("orders_cust_idx", "customer_id");
        bloated.pages = 5_000;
        let findings = identify_bloated(&[bloated]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);

        let healthy = row("orders_ok_idx", "customer_id");
        assert!(identify_bloated(&[healthy]).is_empty());
    }
}
