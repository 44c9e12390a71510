use serde_json::json;

use crate::db::PgDriver;
use crate::error::Result;
use crate::version::VersionProbe;

use super::{Finding, HealthReport, HealthType};

const UTILIZATION_WARN: f64 = 0.70;
const UTILIZATION_CRITICAL: f64 = 0.90;
const IDLE_IN_TX_WARN_SECS: f64 = 300.0;

pub(super) async fn run(driver: &PgDriver, probe: &VersionProbe) -> Result<HealthReport> {
    let rows = driver
        .execute(
            r#"
            SELECT COALESCE(state, 'unknown') AS state, COUNT(*)::bigint AS count
            FROM pg_stat_activity
            GROUP BY 1
            "#,
            &[],
        )
        .await?;
    let mut total = 0i64;
    let mut by_state: Vec<(String, i64)> = Vec::new();
    for row in &rows {
        let state = row.as_str("state").unwrap_or("unknown").to_string();
        let count = row.as_i64("count").unwrap_or(0);
        total += count;
        by_state.push((state, count));
    }

    let max_connections = driver
        .execute(
            "SELECT current_setting('max_connections')::bigint AS max_connections",
            &[],
        )
        .await?
        .first()
        .and_then(|row| row.as_i64("max_connections"))
        .unwrap_or(100);

    let longest_idle_secs = driver
        .execute(
            r#"
            SELECT COALESCE(EXTRACT(EPOCH FROM MAX(now() - state_change)), 0)::float8
                AS longest_idle
            FROM pg_stat_activity
            WHERE state = 'idle in transaction'
            "#,
            &[],
        )
        .await?
        .first()
        .and_then(|row| row.as_f64("longest_idle"))
        .unwrap_or(0.0);

    let mut findings = classify(total, max_connections, &by_state, longest_idle_secs);

    if longest_idle_secs > IDLE_IN_TX_WARN_SECS {
        if let Some(events) = idle_wait_events(driver, probe).await? {
            findings.push(Finding::warning(format!(
                "Idle-in-transaction wait events: {events}"
            )));
        }
    }

    Ok(HealthReport::from_findings(HealthType::Connection, findings))
}

fn classify(
    total: i64,
    max_connections: i64,
    by_state: &[(String, i64)],
    longest_idle_secs: f64,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    let utilization = if max_connections > 0 {
        total as f64 / max_connections as f64
    } else {
        0.0
    };
    let breakdown = by_state
        .iter()
        .map(|(state, count)| format!("{state}={count}"))
        .collect::<Vec<_>>()
        .join(", ");

    if utilization >= UTILIZATION_CRITICAL {
        findings.push(Finding::critical(format!(
            "{total} of {max_connections} connections in use ({:.0}%): {breakdown}",
            utilization * 100.0
        )));
    } else if utilization >= UTILIZATION_WARN {
        findings.push(Finding::warning(format!(
            "{total} of {max_connections} connections in use ({:.0}%): {breakdown}",
            utilization * 100.0
        )));
    } else {
        findings.push(Finding::ok(format!(
            "{total} of {max_connections} connections in use: {breakdown}"
        )));
    }

    if longest_idle_secs > IDLE_IN_TX_WARN_SECS {
        findings.push(Finding::warning(format!(
            "Longest idle-in-transaction session has held its transaction for {:.0}s.",
            longest_idle_secs
        )));
    }
    findings
}

/// PG 17+ exposes pg_wait_events; join it for context when it exists.
async fn idle_wait_events(driver: &PgDriver, probe: &VersionProbe) -> Result<Option<String>> {
    if !probe
        .has_column(driver, "pg_catalog", "pg_wait_events", "name")
        .await?
    {
        return Ok(None);
    }
    let rows = driver
        .execute(
            r#"
            SELECT
                COALESCE(a.wait_event_type, 'Unknown') AS wait_event_type,
                COALESCE(a.wait_event, 'Unknown') AS wait_event,
                COUNT(*)::bigint AS count
            FROM pg_stat_activity a
            WHERE a.state = $1
            GROUP BY 1, 2
            ORDER BY 3 DESC, 1, 2
            "#,
            &[json!("idle in transaction")],
        )
        .await?;
    if rows.is_empty() {
        return Ok(None);
    }
    let summary = rows
        .iter()
        .map(|row| {
            format!(
                "{}:{} (count={})",
                row.as_str("wait_event_type").unwrap_or("Unknown"),
                row.as_str("wait_event").unwrap_or("Unknown"),
                row.as_i64("count").unwrap_or(0)
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    Ok(Some(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Severity;

    fn states() -> Vec<(String, i64)> {
        vec![("active".into(), 5), ("idle".into(), 10)]
    }

    #[test]
    fn utilization_thresholds() {
        let ok = classify(15, 100, &states(), 0.0);
        assert_eq!(ok[0].severity, Severity::Ok);

        let warn = classify(75, 100, &states(), 0.0);
        assert_eq!(warn[0].severity, Severity::Warning);

        let critical = classify(95, 100, &states(), 0.0);
        assert_eq!(critical[0].severity, Severity::Critical);
    }

    #[test]
    fn long_idle_in_transaction_adds_a_warning() {
        let findings = classify(10, 100, &states(), 1200.0);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[1].severity, Severity::Warning);
        assert!(findings[1].message.contains("1200s"));
    }
}
