use crate::db::PgDriver;
use crate::error::Result;
use crate::version::VersionProbe;

use super::{Finding, HealthReport, HealthType};

const HIT_RATIO_WARN: f64 = 0.95;
const HIT_RATIO_CRITICAL: f64 = 0.90;

pub(super) async fn run(driver: &PgDriver, _probe: &VersionProbe) -> Result<HealthReport> {
    const QUERY: &str = r#"
        SELECT
            COALESCE(SUM(heap_blks_hit), 0)::bigint AS heap_hit,
            COALESCE(SUM(heap_blks_read), 0)::bigint AS heap_read,
            COALESCE(SUM(idx_blks_hit), 0)::bigint AS idx_hit,
            COALESCE(SUM(idx_blks_read), 0)::bigint AS idx_read
        FROM pg_statio_user_tables
    "#;
    let rows = driver.execute(QUERY, &[]).await?;
    let row = rows.first();
    let heap_hit = row.and_then(|r| r.as_i64("heap_hit")).unwrap_or(0);
    let heap_read = row.and_then(|r| r.as_i64("heap_read")).unwrap_or(0);
    let idx_hit = row.and_then(|r| r.as_i64("idx_hit")).unwrap_or(0);
    let idx_read = row.and_then(|r| r.as_i64("idx_read")).unwrap_or(0);

    let mut findings = Vec::new();
    findings.push(classify("table", hit_ratio(heap_hit, heap_read)));
    findings.push(classify("index", hit_ratio(idx_hit, idx_read)));
    Ok(HealthReport::from_findings(HealthType::Buffer, findings))
}

fn hit_ratio(hit: i64, read: i64) -> Option<f64> {
    let total = hit + read;
    if total <= 0 {
        None
    } else {
        Some(hit as f64 / total as f64)
    }
}

fn classify(kind: &str, ratio: Option<f64>) -> Finding {
    match ratio {
        None => Finding::ok(format!("No {kind} buffer traffic recorded yet.")),
        Some(r) if r < HIT_RATIO_CRITICAL => Finding::critical(format!(
            "{kind} cache hit ratio {:.1}% is critically low; working set does not fit \
             shared_buffers.",
            r * 100.0
        )),
        Some(r) if r < HIT_RATIO_WARN => Finding::warning(format!(
            "{kind} cache hit ratio {:.1}% is below the 95% target.",
            r * 100.0
        )),
        Some(r) => Finding::ok(format!("{kind} cache hit ratio {:.1}%.", r * 100.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Severity;

    #[test]
    fn ratio_thresholds_map_to_severities() {
        assert_eq!(classify("table", Some(0.99)).severity, Severity::Ok);
        assert_eq!(classify("table", Some(0.93)).severity, Severity::Warning);
        assert_eq!(classify("table", Some(0.85)).severity, Severity::Critical);
        assert_eq!(classify("table", None).severity, Severity::Ok);
    }

    #[test]
    fn hit_ratio_handles_zero_traffic() {
        assert_eq!(hit_ratio(0, 0), None);
        assert_eq!(hit_ratio(95, 5), Some(0.95));
    }
}
