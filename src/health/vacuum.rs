use crate::db::PgDriver;
use crate::error::Result;
use crate::version::VersionProbe;

use super::{Finding, HealthReport, HealthType};

const DEAD_RATIO_ALERT: f64 = 0.20;
const AUTOVACUUM_STALE_SECS: f64 = 86_400.0;
const MIN_LIVE_TUPLES: i64 = 10_000;
const XID_AGE_WARN: i64 = 1_000_000_000;
const XID_AGE_CRITICAL: i64 = 1_500_000_000;

#[derive(Debug, Clone)]
struct TableVacuumRow {
    schema: String,
    table_name: String,
    live_tuples: i64,
    dead_tuples: i64,
    seconds_since_autovacuum: Option<f64>,
    total_autovacuum_ms: Option<f64>,
}

impl TableVacuumRow {
    fn dead_ratio(&self) -> f64 {
        if self.live_tuples <= 0 {
            0.0
        } else {
            self.dead_tuples as f64 / self.live_tuples as f64
        }
    }
}

pub(super) async fn run(driver: &PgDriver, probe: &VersionProbe) -> Result<HealthReport> {
    // PG 18 tracks cumulative vacuum timing per table.
    let has_timing = probe
        .has_column(
            driver,
            "pg_catalog",
            "pg_stat_user_tables",
            "total_autovacuum_time",
        )
        .await?;
    let timing_select = if has_timing {
        "total_autovacuum_time::float8 AS total_autovacuum_ms"
    } else {
        "NULL::float8 AS total_autovacuum_ms"
    };

    let query = format!(
        r#"
        SELECT
            schemaname AS schema_name,
            relname AS table_name,
            COALESCE(n_live_tup, 0) AS live_tuples,
            COALESCE(n_dead_tup, 0) AS dead_tuples,
            EXTRACT(EPOCH FROM (now() - last_autovacuum))::float8
                AS seconds_since_autovacuum,
            {timing_select}
        FROM pg_stat_user_tables
        "#,
    );
    let rows = driver.execute(&query, &[]).await?;
    let tables: Vec<TableVacuumRow> = rows
        .iter()
        .filter_map(|row| {
            Some(TableVacuumRow {
                schema: row.as_str("schema_name")?.to_string(),
                table_name: row.as_str("table_name")?.to_string(),
                live_tuples: row.as_i64("live_tuples").unwrap_or(0),
                dead_tuples: row.as_i64("dead_tuples").unwrap_or(0),
                seconds_since_autovacuum: row.as_f64("seconds_since_autovacuum"),
                total_autovacuum_ms: row.as_f64("total_autovacuum_ms"),
            })
        })
        .collect();

    let xid_age = driver
        .execute(
            r#"
            SELECT age(datfrozenxid)::bigint AS xid_age
            FROM pg_database
            WHERE datname = current_database()
            "#,
            &[],
        )
        .await?
        .first()
        .and_then(|row| row.as_i64("xid_age"))
        .unwrap_or(0);

    let mut findings = classify_tables(&tables);
    findings.extend(classify_xid_age(xid_age));
    if findings.is_empty() {
        findings.push(Finding::ok("Autovacuum is keeping up."));
    }
    Ok(HealthReport::from_findings(HealthType::Vacuum, findings))
}

/// Stale autovacuum alone is normal for quiet tables; only the
/// combination with a high dead-tuple ratio is a problem.
fn classify_tables(tables: &[TableVacuumRow]) -> Vec<Finding> {
    tables
        .iter()
        .filter(|table| {
            let stale = table
                .seconds_since_autovacuum
                .map(|secs| secs > AUTOVACUUM_STALE_SECS)
                .unwrap_or(true);
            table.live_tuples >= MIN_LIVE_TUPLES && table.dead_ratio() > DEAD_RATIO_ALERT && stale
        })
        .map(|table| {
            let last = table
                .seconds_since_autovacuum
                .map(|secs| format!("{:.0}s ago", secs))
                .unwrap_or_else(|| "never".into());
            let timing = table
                .total_autovacuum_ms
                .map(|ms| format!(" (cumulative autovacuum time {ms:.0}ms)"))
                .unwrap_or_default();
            Finding::warning(format!(
                "{}.{} has {:.1}% dead tuples and last autovacuum ran {last}{timing}; \
                 lower its autovacuum scale factor or VACUUM manually.",
                table.schema,
                table.table_name,
                table.dead_ratio() * 100.0
            ))
        })
        .collect()
}

fn classify_xid_age(xid_age: i64) -> Vec<Finding> {
    if xid_age >= XID_AGE_CRITICAL {
        vec![Finding::critical(format!(
            "Transaction ID age {xid_age} approaches wraparound; VACUUM FREEZE now."
        ))]
    } else if xid_age >= XID_AGE_WARN {
        vec![Finding::warning(format!(
            "Transaction ID age {xid_age} is elevated; check autovacuum freeze settings."
        ))]
    } else {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Severity;

    fn table(dead: i64, secs_since: Option<f64>) -> TableVacuumRow {
        TableVacuumRow {
            schema: "public".into(),
            table_name: "orders".into(),
            live_tuples: 100_000,
            dead_tuples: dead,
            seconds_since_autovacuum: secs_since,
            total_autovacuum_ms: None,
        }
    }

    #[test]
    fn needs_both_dead_tuples_and_stale_autovacuum() {
        // Lots of dead tuples but autovacuum ran recently: fine.
        assert!(classify_tables(&[table(30_000, Some(600.0))]).is_empty());
        // Stale autovacuum but few dead tuples: fine.
        assert!(classify_tables(&[table(1_000, Some(200_000.0))]).is_empty());
        // Both: report it.
        let findings = classify_tables(&[table(30_000, Some(200_000.0))]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);
    }

    #[test]
    fn never_vacuumed_counts_as_stale() {
        let findings = classify_tables(&[table(30_000, None)]);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("never"));
    }

    #[test]
    fn xid_age_escalates_to_critical() {
        assert!(classify_xid_age(500_000_000).is_empty());
        assert_eq!(
            classify_xid_age(1_100_000_000)[0].severity,
            Severity::Warning
        );
        assert_eq!(
            classify_xid_age(1_600_000_000)[0].severity,
            Severity::Critical
        );
    }
}
