//! Pluggable candidate proposer for the advisor's refinement pass.
//!
//! The advisor treats proposals as untrusted input: every proposed index
//! re-enters normal hypothetical costing, so a proposer can only add
//! candidates, never skew the cost model. The default proposer suggests
//! nothing; deployments that wire up an external model opt in by
//! supplying their own implementation and setting `OPENAI_API_KEY`.

use futures::future::BoxFuture;

use crate::error::Result;
use crate::models::{IndexDefinition, WorkloadQuery};

pub trait CandidateProposer: Send + Sync {
    /// Propose additional index definitions given the workload and the
    /// advisor's current shortlist.
    fn propose<'a>(
        &'a self,
        workload: &'a [WorkloadQuery],
        shortlist: &'a [IndexDefinition],
    ) -> BoxFuture<'a, Result<Vec<IndexDefinition>>>;
}

/// The shipped default: proposes nothing.
pub struct NoopProposer;

impl CandidateProposer for NoopProposer {
    fn propose<'a>(
        &'a self,
        _workload: &'a [WorkloadQuery],
        _shortlist: &'a [IndexDefinition],
    ) -> BoxFuture<'a, Result<Vec<IndexDefinition>>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Whether an external proposer should be consulted at all.
pub fn refinement_enabled() -> bool {
    std::env::var("OPENAI_API_KEY")
        .map(|key| !key.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_proposer_returns_nothing() {
        let proposer = NoopProposer;
        let proposed = proposer.propose(&[], &[]).await.unwrap();
        assert!(proposed.is_empty());
    }
}
