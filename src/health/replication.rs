use crate::db::PgDriver;
use crate::error::Result;
use crate::version::VersionProbe;

use super::{Finding, HealthReport, HealthType};

const LAG_WARN_BYTES: i64 = 1024 * 1024 * 1024;
const LAG_CRITICAL_BYTES: i64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
struct SlotRow {
    slot_name: String,
    active: bool,
    lag_bytes: Option<i64>,
    invalidation_reason: Option<String>,
    inactive_since: Option<String>,
    failover: Option<bool>,
    synced: Option<bool>,
}

pub(super) async fn run(driver: &PgDriver, probe: &VersionProbe) -> Result<HealthReport> {
    let in_recovery = driver
        .execute("SELECT pg_is_in_recovery() AS in_recovery", &[])
        .await?
        .first()
        .and_then(|row| row.as_bool("in_recovery"))
        .unwrap_or(false);

    let standby_count = driver
        .execute(
            "SELECT COUNT(*)::bigint AS standbys FROM pg_stat_replication",
            &[],
        )
        .await?
        .first()
        .and_then(|row| row.as_i64("standbys"))
        .unwrap_or(0);

    let slots = fetch_slots(driver, probe, in_recovery).await?;
    let findings = classify(in_recovery, standby_count, &slots);
    Ok(HealthReport::from_findings(HealthType::Replication, findings))
}

async fn fetch_slots(
    driver: &PgDriver,
    probe: &VersionProbe,
    in_recovery: bool,
) -> Result<Vec<SlotRow>> {
    // PG 17 slot bookkeeping columns, projected as nulls when absent.
    let mut optional = Vec::new();
    for (column, cast) in [
        ("invalidation_reason", "text"),
        ("inactive_since", "text"),
        ("failover", "boolean"),
        ("synced", "boolean"),
    ] {
        let select = if probe
            .has_column(driver, "pg_catalog", "pg_replication_slots", column)
            .await?
        {
            format!("{column}::{cast} AS {column}")
        } else {
            format!("NULL::{cast} AS {column}")
        };
        optional.push(select);
    }

    // On a standby there is no current WAL insert position.
    let lag_expr = if in_recovery {
        "pg_wal_lsn_diff(pg_last_wal_replay_lsn(), restart_lsn)::bigint"
    } else {
        "pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn)::bigint"
    };

    let query = format!(
        r#"
        SELECT
            slot_name,
            active,
            CASE WHEN restart_lsn IS NULL THEN NULL ELSE {lag_expr} END AS lag_bytes,
            {optional}
        FROM pg_replication_slots
        "#,
        optional = optional.join(",\n            "),
    );

    let rows = driver.execute(&query, &[]).await?;
    Ok(rows
        .iter()
        .filter_map(|row| {
            Some(SlotRow {
                slot_name: row.as_str("slot_name")?.to_string(),
                active: row.as_bool("active").unwrap_or(false),
                lag_bytes: row.as_i64("lag_bytes"),
                invalidation_reason: row.as_str("invalidation_reason").map(str::to_string),
                inactive_since: row.as_str("inactive_since").map(str::to_string),
                failover: row.as_bool("failover"),
                synced: row.as_bool("synced"),
            })
        })
        .collect())
}

fn classify(in_recovery: bool, standby_count: i64, slots: &[SlotRow]) -> Vec<Finding> {
    let mut findings = Vec::new();
    if in_recovery {
        findings.push(Finding::ok("This is a replica."));
    } else if standby_count > 0 {
        findings.push(Finding::ok(format!(
            "Primary with {standby_count} connected standby(s)."
        )));
    } else if !slots.is_empty() {
        findings.push(Finding::warning(
            "Replication slots exist but no standby is connected.",
        ));
    } else {
        findings.push(Finding::ok("Primary with no replication configured."));
    }

    for slot in slots {
        if let Some(reason) = &slot.invalidation_reason {
            findings.push(Finding::critical(format!(
                "Slot {} was invalidated ({reason}); the standby must be rebuilt.",
                slot.slot_name
            )));
            continue;
        }
        if !slot.active {
            let since = slot
                .inactive_since
                .as_deref()
                .map(|s| format!(" since {s}"))
                .unwrap_or_default();
            findings.push(Finding::warning(format!(
                "Slot {} is inactive{since} and retains WAL{}.",
                slot.slot_name,
                slot.lag_bytes
                    .map(|b| format!(" ({b} bytes behind)"))
                    .unwrap_or_default()
            )));
            continue;
        }
        match slot.lag_bytes {
            Some(lag) if lag >= LAG_CRITICAL_BYTES => findings.push(Finding::critical(format!(
                "Slot {} is {lag} bytes behind.",
                slot.slot_name
            ))),
            Some(lag) if lag >= LAG_WARN_BYTES => findings.push(Finding::warning(format!(
                "Slot {} is {lag} bytes behind.",
                slot.slot_name
            ))),
            _ => {
                let mut details = Vec::new();
                if let Some(failover) = slot.failover {
                    details.push(format!("failover={failover}"));
                }
                if let Some(synced) = slot.synced {
                    details.push(format!("synced={synced}"));
                }
                let suffix = if details.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", details.join(", "))
                };
                findings.push(Finding::ok(format!(
                    "Slot {} is active{suffix}.",
                    slot.slot_name
                )));
            }
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Severity;

    fn slot(name: &str) -> SlotRow {
        SlotRow {
            slot_name: name.into(),
            active: true,
            lag_bytes: Some(1024),
            invalidation_reason: None,
            inactive_since: None,
            failover: None,
            synced: None,
        }
    }

    #[test]
    fn inactive_slot_warns_and_invalidated_slot_is_critical() {
        let mut inactive = slot("standby_a");
        inactive.active = false;
        let mut invalidated = slot("standby_b");
        invalidated.invalidation_reason = Some("wal_removed".into());

        let findings = classify(false, 1, &[inactive, invalidated]);
        assert_eq!(findings[1].severity, Severity::Warning);
        assert_eq!(findings[2].severity, Severity::Critical);
        assert!(findings[2].message.contains("wal_removed"));
    }

    #[test]
    fn lag_thresholds_apply_to_active_slots() {
        let mut lagging = slot("standby_a");
        lagging.lag_bytes = Some(2 * 1024 * 1024 * 1024);
        let findings = classify(false, 1, &[lagging]);
        assert_eq!(findings[1].severity, Severity::Warning);

        let mut far_behind = slot("standby_b");
        far_behind.lag_bytes = Some(6 * 1024 * 1024 * 1024);
        let findings = classify(false, 1, &[far_behind]);
        assert_eq!(findings[1].severity, Severity::Critical);
    }

    #[test]
    fn orphaned_slots_without_standbys_warn() {
        let findings = classify(false, 0, &[slot("stale")]);
        assert_eq!(findings[0].severity, Severity::Warning);
    }
}
