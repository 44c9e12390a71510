//! Database health checks.
//!
//! Seven independent read-only calculators behind one interface. The
//! orchestrator fans them out concurrently on the shared driver, bounds
//! each with a wall-clock timeout, and folds failures into the composite
//! report as warnings instead of failing the whole check.

pub mod buffer;
pub mod connections;
pub mod constraints;
pub mod indexes;
pub mod replication;
pub mod sequences;
pub mod vacuum;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::Driver;
use crate::error::{DbaError, Result};
use crate::version::VersionProbe;

const CALCULATOR_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthType {
    Index,
    Buffer,
    Connection,
    Replication,
    Sequence,
    Constraint,
    Vacuum,
}

impl HealthType {
    pub const ALL: [HealthType; 7] = [
        HealthType::Index,
        HealthType::Buffer,
        HealthType::Connection,
        HealthType::Replication,
        HealthType::Sequence,
        HealthType::Constraint,
        HealthType::Vacuum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthType::Index => "index",
            HealthType::Buffer => "buffer",
            HealthType::Connection => "connection",
            HealthType::Replication => "replication",
            HealthType::Sequence => "sequence",
            HealthType::Constraint => "constraint",
            HealthType::Vacuum => "vacuum",
        }
    }

    /// Parse `"all"` or a comma-separated subset like `"index,vacuum"`.
    pub fn parse_list(selection: &str) -> Result<Vec<HealthType>> {
        let selection = selection.trim();
        if selection.is_empty() || selection.eq_ignore_ascii_case("all") {
            return Ok(Self::ALL.to_vec());
        }
        let mut types = Vec::new();
        for part in selection.split(',') {
            let part = part.trim().to_lowercase();
            let health_type = Self::ALL
                .iter()
                .find(|t| t.as_str() == part)
                .copied()
                .ok_or_else(|| DbaError::InvalidArguments {
                    message: format!(
                        "unknown health check '{part}'; valid checks: {}, all",
                        Self::ALL.map(|t| t.as_str()).join(", ")
                    ),
                })?;
            if !types.contains(&health_type) {
                types.push(health_type);
            }
        }
        Ok(types)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Ok => "ok",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Ok,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub health_type: HealthType,
    pub severity: Severity,
    pub findings: Vec<Finding>,
}

impl HealthReport {
    pub fn from_findings(health_type: HealthType, findings: Vec<Finding>) -> Self {
        let severity = findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Ok);
        Self {
            health_type,
            severity,
            findings,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub severity: Severity,
    pub reports: Vec<HealthReport>,
}

/// Fan the requested calculators out concurrently and compose severities.
pub async fn run_checks(
    driver: &Driver,
    probe: &VersionProbe,
    types: &[HealthType],
) -> HealthSummary {
    let checks = types.iter().map(|t| run_one(driver, probe, *t));
    let reports = futures::future::join_all(checks).await;
    let severity = reports
        .iter()
        .map(|r| r.severity)
        .max()
        .unwrap_or(Severity::Ok);
    HealthSummary { severity, reports }
}

async fn run_one(driver: &Driver, probe: &VersionProbe, health_type: HealthType) -> HealthReport {
    let calc = async {
        match health_type {
            HealthType::Index => indexes::run(driver.base(), probe).await,
            HealthType::Buffer => buffer::run(driver.base(), probe).await,
            HealthType::Connection => connections::run(driver.base(), probe).await,
            HealthType::Replication => replication::run(driver.base(), probe).await,
            HealthType::Sequence => sequences::run(driver.base(), probe).await,
            HealthType::Constraint => constraints::run(driver.base(), probe).await,
            HealthType::Vacuum => vacuum::run(driver.base(), probe).await,
        }
    };
    match tokio::time::timeout(CALCULATOR_TIMEOUT, calc).await {
        Ok(Ok(report)) => report,
        Ok(Err(err)) => {
            warn!("{} health check failed: {err}", health_type.as_str());
            failure_report(health_type, err.to_string())
        }
        Err(_) => failure_report(
            health_type,
            format!(
                "check did not finish within {}s",
                CALCULATOR_TIMEOUT.as_secs()
            ),
        ),
    }
}

fn failure_report(health_type: HealthType, message: String) -> HealthReport {
    HealthReport::from_findings(
        health_type,
        vec![Finding::warning(format!(
            "{} check could not run: {message}",
            health_type.as_str()
        ))],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_accepts_all_and_subsets() {
        assert_eq!(HealthType::parse_list("all").unwrap().len(), 7);
        assert_eq!(
            HealthType::parse_list("index, vacuum").unwrap(),
            vec![HealthType::Index, HealthType::Vacuum]
        );
        assert!(HealthType::parse_list("index,bogus").is_err());
    }

    #[test]
    fn severity_composes_to_the_worst_finding() {
        let report = HealthReport::from_findings(
            HealthType::Buffer,
            vec![
                Finding::ok("fine"),
                Finding::critical("bad"),
                Finding::warning("meh"),
            ],
        );
        assert_eq!(report.severity, Severity::Critical);

        let empty = HealthReport::from_findings(HealthType::Buffer, vec![]);
        assert_eq!(empty.severity, Severity::Ok);
    }

    #[test]
    fn calculator_failures_become_warning_findings() {
        let report = failure_report(HealthType::Replication, "no pg_stat_replication".into());
        assert_eq!(report.severity, Severity::Warning);
        assert!(report.findings[0].message.contains("replication"));
    }
}
