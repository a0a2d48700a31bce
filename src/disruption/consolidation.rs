//! Shared consolidation machinery: the scheduling simulation disruption
//! reuses, and the policy predicates that gate it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use super::candidate::Candidate;
use crate::apis::nodeclaim::{NodeClaim, condition, jiff_to_chrono};
use crate::apis::nodepool::{ActionWindow, ConsolidationPolicy, NodePool};
use crate::provisioning::SchedulerInputs;
use crate::requirements::Requirements;
use crate::resources::PodId;
use crate::scheduling::proposal::NodeProposal;
use crate::scheduling::scheduler::Scheduler;

pub struct SimResult {
    /// Every displaced pod found a home.
    pub scheduled: bool,
    pub new_nodes: Vec<NodeProposal>,
}

impl SimResult {
    pub fn total_price(&self) -> f64 {
        self.new_nodes.iter().filter_map(|n| n.price()).sum()
    }
}

/// Simulate removing `candidates`: can their pods reschedule onto the rest
/// of the cluster plus (if needed) new nodes? This is the provisioning
/// scheduler run against a snapshot with the candidates carved out.
pub fn simulate(
    inputs: &SchedulerInputs,
    volume: &BTreeMap<PodId, Requirements>,
    candidates: &[&Candidate],
) -> SimResult {
    let excluded_keys: BTreeSet<&str> =
        candidates.iter().map(|c| c.state_key.as_str()).collect();
    let excluded_nodes: BTreeSet<String> = candidates.iter().map(|c| c.node_name()).collect();

    let nodes: Vec<_> = inputs
        .snapshot
        .iter()
        .filter(|(key, state)| {
            !excluded_keys.contains(key.as_str()) && !state.marked_for_deletion
        })
        .cloned()
        .collect();

    // Pods leaving the candidates must not count as placed.
    let bound: Vec<_> = inputs
        .bound_pods
        .iter()
        .filter(|(pod, _)| {
            pod.spec
                .as_ref()
                .and_then(|s| s.node_name.as_ref())
                .map(|n| !excluded_nodes.contains(n))
                .unwrap_or(true)
        })
        .cloned()
        .collect();

    let batch: Vec<_> = candidates
        .iter()
        .flat_map(|c| c.reschedulable_pods.iter().cloned())
        .collect();

    let scheduler = Scheduler::new(
        nodes,
        inputs.pools.clone(),
        inputs.instance_types.clone(),
        inputs.daemon_overhead.clone(),
        inputs.pool_usage.clone(),
        volume.clone(),
        &bound,
        batch,
        &inputs.anti_affinity_pods,
    );
    let results = scheduler.solve();
    SimResult {
        scheduled: results.errors.is_empty(),
        new_nodes: results.new_nodes,
    }
}

/// Consolidation is off entirely when `consolidateAfter` is `Never`.
pub fn consolidation_enabled(pool: &NodePool) -> bool {
    match pool.spec.disruption.consolidate_after() {
        Ok(ActionWindow::Never) => pool.spec.disruption.consolidate_after.is_none(),
        Ok(ActionWindow::After(_)) => true,
        Err(_) => false,
    }
}

/// Whether the claim has been idle long enough for consolidation to act:
/// the `Empty` condition (or creation, for never-empty nodes) must predate
/// `consolidateAfter`.
pub fn past_consolidate_after(pool: &NodePool, claim: &NodeClaim, now: DateTime<Utc>) -> bool {
    let window = match pool.spec.disruption.consolidate_after() {
        Ok(ActionWindow::After(d)) => d,
        Ok(ActionWindow::Never) => {
            // Enabled-without-delay (consolidateAfter unset under
            // WhenUnderutilized) acts immediately.
            return pool.spec.disruption.consolidate_after.is_none();
        }
        Err(_) => return false,
    };
    let since = claim
        .status_condition(condition::EMPTY)
        .filter(|c| c.status == "True")
        .map(|c| jiff_to_chrono(c.last_transition_time.0))
        .or_else(|| claim.metadata.creation_timestamp.as_ref().map(|t| jiff_to_chrono(t.0)));
    since
        .map(|t| now - t >= chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero()))
        .unwrap_or(false)
}

/// Underutilized-policy pools mark nodes Consolidatable; only those nodes
/// feed single- and multi-node consolidation.
pub fn underutilized_eligible(pool: &NodePool, c: &Candidate) -> bool {
    pool.spec.disruption.consolidation_policy == ConsolidationPolicy::WhenUnderutilized
        && consolidation_enabled(pool)
        && c.state
            .node_claim
            .as_ref()
            .map(|claim| claim.condition_is_true(condition::CONSOLIDATABLE))
            .unwrap_or(false)
}

/// Build replacement claims from simulated proposals, keeping only
/// instance options cheaper than the given price when one is set.
pub fn replacement_claims(
    proposals: &[NodeProposal],
    pools: &BTreeMap<String, NodePool>,
    cheaper_than: Option<f64>,
) -> Option<Vec<NodeClaim>> {
    let mut claims = Vec::new();
    for proposal in proposals {
        let pool = pools.get(&proposal.pool_name)?;
        let mut narrowed = proposal.clone();
        if let Some(price_cap) = cheaper_than {
            narrowed.instance_types.retain(|it| {
                it.cheapest_price(&narrowed.requirements)
                    .map(|p| p < price_cap)
                    .unwrap_or(false)
            });
            if narrowed.instance_types.is_empty() {
                return None;
            }
        }
        let mut claim = narrowed.to_node_claim(pool);
        crate::apis::nodeclaim::finalize_name(&mut claim);
        claims.push(claim);
    }
    Some(claims)
}
