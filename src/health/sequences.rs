use crate::db::PgDriver;
use crate::error::Result;
use crate::version::VersionProbe;

use super::{Finding, HealthReport, HealthType};

const CONSUMED_WARN: f64 = 0.80;
const CONSUMED_CRITICAL: f64 = 0.95;

#[derive(Debug, Clone)]
struct SequenceRow {
    schema: String,
    name: String,
    last_value: i64,
    max_value: i64,
}

impl SequenceRow {
    fn consumed_fraction(&self) -> f64 {
        if self.max_value <= 0 {
            0.0
        } else {
            self.last_value as f64 / self.max_value as f64
        }
    }
}

pub(super) async fn run(driver: &PgDriver, _probe: &VersionProbe) -> Result<HealthReport> {
    const QUERY: &str = r#"
        SELECT
            schemaname AS schema_name,
            sequencename AS sequence_name,
            COALESCE(last_value, 0) AS last_value,
            max_value
        FROM pg_sequences
        WHERE max_value > 0
    "#;
    let rows = driver.execute(QUERY, &[]).await?;
    let sequences: Vec<SequenceRow> = rows
        .iter()
        .filter_map(|row| {
            Some(SequenceRow {
                schema: row.as_str("schema_name")?.to_string(),
                name: row.as_str("sequence_name")?.to_string(),
                last_value: row.as_i64("last_value").unwrap_or(0),
                max_value: row.as_i64("max_value").unwrap_or(0),
            })
        })
        .collect();

    let mut findings = classify(&sequences);
    if findings.is_empty() {
        findings.push(Finding::ok(format!(
            "{} sequence(s), none near their maximum value.",
            sequences.len()
        )));
    }
    Ok(HealthReport::from_findings(HealthType::Sequence, findings))
}

fn classify(sequences: &[SequenceRow]) -> Vec<Finding> {
    sequences
        .iter()
        .filter_map(|seq| {
            let fraction = seq.consumed_fraction();
            let message = format!(
                "Sequence {}.{} has consumed {:.1}% of its maximum value \
                 ({} of {}).",
                seq.schema,
                seq.name,
                fraction * 100.0,
                seq.last_value,
                seq.max_value
            );
            if fraction >= CONSUMED_CRITICAL {
                Some(Finding::critical(message))
            } else if fraction >= CONSUMED_WARN {
                Some(Finding::warning(message))
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

    fn seq(last_value: i64, max_value: i64) -> SequenceRow {
        SequenceRow {
            schema: "public".into(),
            name: "orders_id_seq".into(),
            last_value,
            max_value,
        }
    }

    #[test]
    fn thresholds_at_80_and_95_percent() {
        assert!(classify(&[seq(10, 100)]).is_empty());
        assert_eq!(classify(&[seq(85, 100)])[0].severity, Severity::Warning);
        assert_eq!(classify(&[seq(96, 100)])[0].severity, Severity::Critical);
    }

    #[test]
    fn int4_sequence_near_exhaustion_is_critical() {
        let near = seq(2_100_000_000, i32::MAX as i64);
        let findings = classify(&[near]);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert!(findings[0].message.contains("orders_id_seq"));
    }
}
