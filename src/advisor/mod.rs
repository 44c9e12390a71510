//! Workload-driven index advisor.
//!
//! An anytime variant of the classic tuning-advisor loop: enumerate
//! candidates from the workload's predicates, cost them as HypoPG
//! hypothetical indexes against generic plans, then greedily grow the
//! recommended set, re-costing the whole set at every step because
//! indexes interact. The search checkpoints its best solution and honors
//! a wall-clock budget; truncation surfaces as `partial = true`, never as
//! an error. The session is always left with zero hypothetical indexes.

pub mod candidates;
pub mod proposer;
pub mod query_parser;

use std::time::Duration;

use serde_json::json;
use sqlx::PgConnection;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::db::driver::execute_on;
use crate::db::Driver;
use crate::error::{DbaError, Result};
use crate::explain::{generic_plan_cost, HYPOPG};
use crate::models::{AdvisorReport, IndexDefinition, IndexRecommendation, WorkloadQuery};
use crate::version::{ServerInfo, VersionProbe};

use self::candidates::Candidate;
use self::proposer::CandidateProposer;

/// Inline query analysis accepts at most this many statements.
pub const MAX_INLINE_QUERIES: usize = 10;

const SKIP_SCAN_PRIORITY_FACTOR: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    pub max_indexes: usize,
    pub max_total_size_bytes: i64,
    pub max_columns_per_index: usize,
    /// Keep a candidate only while `proposed / baseline` stays below this.
    pub min_cost_ratio: f64,
    pub budget: Duration,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            max_indexes: 10,
            max_total_size_bytes: 10_000 * 1024 * 1024,
            max_columns_per_index: 3,
            min_cost_ratio: 0.95,
            budget: Duration::from_secs(60),
        }
    }
}

impl AdvisorConfig {
    pub fn with_max_size_mb(mut self, max_size_mb: i64) -> Self {
        self.max_total_size_bytes = max_size_mb.max(1) * 1024 * 1024;
        self
    }
}

#[derive(Debug, Clone)]
struct Evaluated {
    candidate: Candidate,
    benefit: f64,
    size_bytes: i64,
    /// Workload indices this candidate improved on its own.
    affected: Vec<usize>,
}

pub async fn analyze_workload(
    driver: &Driver,
    probe: &VersionProbe,
    workload: &[WorkloadQuery],
    config: &AdvisorConfig,
    proposer: Option<&dyn CandidateProposer>,
) -> Result<AdvisorReport> {
    if workload.is_empty() {
        return Ok(AdvisorReport::default());
    }
    let info = probe.server_info(driver.base()).await?;
    probe.require_extension(driver.base(), HYPOPG).await?;

    let catalog = candidates::fetch_index_catalog(driver.base()).await?;
    let generated =
        candidates::generate(workload, &catalog, info.major, config.max_columns_per_index);
    debug!(
        "Advisor considering {} candidates ({} workload queries unparseable)",
        generated.candidates.len(),
        generated.parse_failures
    );

    let deadline = Instant::now() + config.budget;
    let mut conn = driver.base().pool().acquire().await?;
    let outcome = search(
        &mut conn,
        info,
        workload,
        generated.candidates,
        config,
        proposer,
        deadline,
    )
    .await;
    // Hypothetical indexes never outlive the call, success or not.
    if let Err(err) = execute_on(&mut conn, "SELECT hypopg_reset()", &[]).await {
        warn!("hypopg_reset failed after advisor run: {err}");
    }
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn search(
    conn: &mut PgConnection,
    info: ServerInfo,
    workload: &[WorkloadQuery],
    mut pool: Vec<Candidate>,
    config: &AdvisorConfig,
    proposer: Option<&dyn CandidateProposer>,
    deadline: Instant,
) -> Result<AdvisorReport> {
    let mut report = AdvisorReport {
        queries_examined: workload.len(),
        ..Default::default()
    };

    execute_on(conn, "SELECT hypopg_reset()", &[]).await?;
    let mut baselines: Vec<Option<f64>> = Vec::with_capacity(workload.len());
    for query in workload {
        if Instant::now() >= deadline {
            report.partial = true;
            break;
        }
        match generic_plan_cost(conn, info, &query.query_text).await {
            Ok(cost) => baselines.push(Some(cost)),
            Err(err) => {
                warn!("Could not cost workload query: {err}");
                baselines.push(None);
                report.queries_skipped += 1;
            }
        }
    }
    while baselines.len() < workload.len() {
        baselines.push(None);
        report.queries_skipped += 1;
    }

    let baseline_total = weighted_total(workload, &baselines, &baselines);
    report.baseline_total_cost = baseline_total;
    report.proposed_total_cost = baseline_total;
    if baseline_total <= 0.0 {
        return Ok(report);
    }

    if let Some(proposer) = proposer {
        let shortlist: Vec<IndexDefinition> =
            pool.iter().map(|c| c.definition.clone()).collect();
        match proposer.propose(workload, &shortlist).await {
            Ok(proposals) => {
                for definition in proposals {
                    if definition.validate().is_err() {
                        continue;
                    }
                    if pool
                        .iter()
                        .any(|c| c.definition.fingerprint() == definition.fingerprint())
                    {
                        continue;
                    }
                    pool.push(Candidate {
                        definition,
                        query_indices: (0..workload.len()).collect(),
                        demoted: false,
                    });
                }
            }
            Err(err) => warn!("Candidate proposer failed, continuing without it: {err}"),
        }
    }

    let mut evaluated: Vec<Evaluated> = Vec::new();
    for candidate in &pool {
        if Instant::now() >= deadline {
            report.partial = true;
            break;
        }
        match evaluate_single(conn, info, workload, &baselines, candidate).await {
            Ok(Some(entry)) => evaluated.push(entry),
            Ok(None) => {}
            Err(err) => {
                // Per-candidate failures demote the candidate, not the run.
                warn!(
                    "Demoting candidate {}: {err}",
                    candidate.definition.ddl()
                );
            }
        }
    }
    evaluated.sort_by(|a, b| {
        priority(b)
            .partial_cmp(&priority(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut selected: Vec<Evaluated> = Vec::new();
    let mut selected_size: i64 = 0;
    let mut current_total = baseline_total;
    let mut final_costs = baselines.clone();

    'grow: while selected.len() < config.max_indexes && !evaluated.is_empty() {
        let mut best: Option<(usize, f64, Vec<Option<f64>>)> = None;
        for (idx, entry) in evaluated.iter().enumerate() {
            if Instant::now() >= deadline {
                report.partial = true;
                break 'grow;
            }
            if selected_size + entry.size_bytes > config.max_total_size_bytes {
                continue;
            }
            let mut set: Vec<&IndexDefinition> =
                selected.iter().map(|s| &s.candidate.definition).collect();
            set.push(&entry.candidate.definition);
            // Indexes interact; cost the whole prospective set, never
            // benefits additively.
            match cost_with_set(conn, info, workload, &baselines, &set).await {
                Ok(costs) => {
                    let total = weighted_total(workload, &baselines, &costs);
                    if total < current_total
                        && best.as_ref().map(|(_, t, _)| total < *t).unwrap_or(true)
                    {
                        best = Some((idx, total, costs));
                    }
                }
                Err(err) => warn!(
                    "Dropping candidate {} from this round: {err}",
                    entry.candidate.definition.ddl()
                ),
            }
        }
        let Some((idx, total, costs)) = best else {
            break;
        };
        if total / current_total >= config.min_cost_ratio {
            break;
        }
        let entry = evaluated.remove(idx);
        selected_size += entry.size_bytes;
        current_total = total;
        final_costs = costs;
        selected.push(entry);
    }

    report.proposed_total_cost = current_total;
    report.recommendations = build_recommendations(
        &selected,
        workload,
        &baselines,
        &final_costs,
        config.min_cost_ratio,
    );
    Ok(report)
}

fn priority(entry: &Evaluated) -> f64 {
    if entry.candidate.demoted {
        entry.benefit * SKIP_SCAN_PRIORITY_FACTOR
    } else {
        entry.benefit
    }
}

async fn evaluate_single(
    conn: &mut PgConnection,
    info: ServerInfo,
    workload: &[WorkloadQuery],
    baselines: &[Option<f64>],
    candidate: &Candidate,
) -> Result<Option<Evaluated>> {
    execute_on(conn, "SELECT hypopg_reset()", &[]).await?;
    let oid = install_hypothetical(conn, &candidate.definition).await?;
    let size_bytes = hypothetical_size(conn, oid).await.unwrap_or(0);

    let mut benefit = 0.0;
    let mut affected = Vec::new();
    for (i, query) in workload.iter().enumerate() {
        let Some(baseline) = baselines[i] else {
            continue;
        };
        match generic_plan_cost(conn, info, &query.query_text).await {
            Ok(cost) if cost < baseline => {
                benefit += query.calls as f64 * (baseline - cost);
                affected.push(i);
            }
            Ok(_) => {}
            Err(err) => debug!("Costing failed under candidate: {err}"),
        }
    }
    execute_on(conn, "SELECT hypopg_reset()", &[]).await?;

    if benefit <= 0.0 {
        return Ok(None);
    }
    Ok(Some(Evaluated {
        candidate: candidate.clone(),
        benefit,
        size_bytes,
        affected,
    }))
}

async fn cost_with_set(
    conn: &mut PgConnection,
    info: ServerInfo,
    workload: &[WorkloadQuery],
    baselines: &[Option<f64>],
    set: &[&IndexDefinition],
) -> Result<Vec<Option<f64>>> {
    execute_on(conn, "SELECT hypopg_reset()", &[]).await?;
    for definition in set {
        install_hypothetical(conn, definition).await?;
    }
    let mut costs = Vec::with_capacity(workload.len());
    for (i, query) in workload.iter().enumerate() {
        if baselines[i].is_none() {
            costs.push(None);
            continue;
        }
        costs.push(generic_plan_cost(conn, info, &query.query_text).await.ok());
    }
    Ok(costs)
}

async fn install_hypothetical(conn: &mut PgConnection, definition: &IndexDefinition) -> Result<i64> {
    definition.validate()?;
    let rows = execute_on(
        conn,
        "SELECT indexrelid FROM hypopg_create_index($1)",
        &[json!(definition.ddl())],
    )
    .await?;
    rows.first()
        .and_then(|row| row.as_i64("indexrelid"))
        .ok_or_else(|| DbaError::internal("hypopg_create_index returned no handle"))
}

async fn hypothetical_size(conn: &mut PgConnection, oid: i64) -> Result<i64> {
    let rows = execute_on(
        conn,
        "SELECT hypopg_relation_size($1::oid) AS size_bytes",
        &[json!(oid)],
    )
    .await?;
    rows.first()
        .and_then(|row| row.as_i64("size_bytes"))
        .ok_or_else(|| DbaError::internal("hypopg_relation_size returned no rows"))
}

/// Total workload cost in planner units, weighted by call counts. A query
/// whose costing failed under the candidate set is charged its baseline,
/// so a flaky candidate cannot look better than reality.
fn weighted_total(
    workload: &[WorkloadQuery],
    baselines: &[Option<f64>],
    costs: &[Option<f64>],
) -> f64 {
    let mut total = 0.0;
    for (i, query) in workload.iter().enumerate() {
        let Some(baseline) = baselines.get(i).copied().flatten() else {
            continue;
        };
        let cost = costs.get(i).copied().flatten().unwrap_or(baseline);
        total += query.calls as f64 * cost;
    }
    total
}

fn build_recommendations(
    selected: &[Evaluated],
    workload: &[WorkloadQuery],
    baselines: &[Option<f64>],
    final_costs: &[Option<f64>],
    min_cost_ratio: f64,
) -> Vec<IndexRecommendation> {
    let mut recommendations = Vec::new();
    for entry in selected {
        let mut baseline_cost = 0.0;
        let mut proposed_cost = 0.0;
        let mut affected_queries = Vec::new();
        for &i in &entry.affected {
            let Some(baseline) = baselines.get(i).copied().flatten() else {
                continue;
            };
            let calls = workload[i].calls as f64;
            baseline_cost += calls * baseline;
            proposed_cost += calls * final_costs.get(i).copied().flatten().unwrap_or(baseline);
            affected_queries.push(workload[i].queryid.unwrap_or(i as i64));
        }
        if baseline_cost <= 0.0 || proposed_cost > baseline_cost {
            continue;
        }
        if proposed_cost / baseline_cost >= min_cost_ratio {
            continue;
        }
        recommendations.push(IndexRecommendation {
            definition: entry.candidate.definition.clone(),
            estimated_size_bytes: entry.size_bytes,
            baseline_cost,
            proposed_cost,
            affected_queries,
        });
    }
    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TableRef;

    fn query(text: &str, calls: i64, queryid: Option<i64>) -> WorkloadQuery {
        WorkloadQuery {
            query_text: text.into(),
            calls,
            mean_exec_ms: 1.0,
            queryid,
        }
    }

    fn evaluated(columns: &[&str], benefit: f64, affected: Vec<usize>) -> Evaluated {
        Evaluated {
            candidate: Candidate {
                definition: IndexDefinition::btree(
                    TableRef::new(None, "t"),
                    columns.iter().map(|c| c.to_string()).collect(),
                ),
                query_indices: affected.clone(),
                demoted: false,
            },
            benefit,
            size_bytes: 1024,
            affected,
        }
    }

    #[test]
    fn weighted_total_charges_baseline_for_failed_costings() {
        let workload = vec![query("q1", 10, None), query("q2", 5, None)];
        let baselines = vec![Some(100.0), Some(40.0)];
        let costs = vec![Some(20.0), None];
        // 10 * 20 + 5 * 40 (fallback to baseline)
        assert_eq!(weighted_total(&workload, &baselines, &costs), 400.0);
    }

    #[test]
    fn weighted_total_skips_queries_without_baseline() {
        let workload = vec![query("q1", 10, None)];
        let baselines = vec![None];
        let costs = vec![Some(1.0)];
        assert_eq!(weighted_total(&workload, &baselines, &costs), 0.0);
    }

    #[test]
    fn recommendations_keep_the_monotone_improvement_invariant() {
        let workload = vec![query("q1", 100, Some(7))];
        let baselines = vec![Some(150.0)];
        // Final costs regressed: the recommendation must be dropped.
        let worse = build_recommendations(
            &[evaluated(&["a"], 1000.0, vec![0])],
            &workload,
            &baselines,
            &[Some(200.0)],
            0.95,
        );
        assert!(worse.is_empty());

        let better = build_recommendations(
            &[evaluated(&["a"], 1000.0, vec![0])],
            &workload,
            &baselines,
            &[Some(10.0)],
            0.95,
        );
        assert_eq!(better.len(), 1);
        assert_eq!(better[0].affected_queries, vec![7]);
        assert!(better[0].proposed_cost <= better[0].baseline_cost);
    }

    #[test]
    fn marginal_recommendations_are_discarded() {
        let workload = vec![query("q1", 10, None)];
        let baselines = vec![Some(100.0)];
        // 96% of baseline: above the 0.95 ratio bar.
        let marginal = build_recommendations(
            &[evaluated(&["a"], 40.0, vec![0])],
            &workload,
            &baselines,
            &[Some(96.0)],
            0.95,
        );
        assert!(marginal.is_empty());
    }

    #[test]
    fn demoted_candidates_rank_below_equal_benefit() {
        let mut plain = evaluated(&["a"], 100.0, vec![0]);
        plain.candidate.demoted = false;
        let mut demoted = evaluated(&["b"], 100.0, vec![0]);
        demoted.candidate.demoted = true;
        assert!(priority(&plain) > priority(&demoted));
    }
}
