//! Multi-node consolidation: binary-search the largest prefix of the
//! cheapest-to-disrupt candidates that can collapse into fewer or cheaper
//! nodes.
//!
//! When replacement sets of equal cost exist the search is tie-broken
//! deterministically: fewer replacements win, then the lexically smallest
//! pool name.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::candidate::Candidate;
use super::consolidation::{self, SimResult};
use super::{Command, MethodContext};
use crate::apis::nodepool::{DisruptionReason, NodePool};

pub struct MultiNode;

struct Plan {
    count: usize,
    sim: SimResult,
}

impl MultiNode {
    pub fn should_disrupt(&self, pool: &NodePool, c: &Candidate, _now: DateTime<Utc>) -> bool {
        consolidation::underutilized_eligible(pool, c) || c.is_empty()
    }

    fn try_prefix(&self, ctx: &MethodContext, n: usize) -> Option<Plan> {
        let prefix: Vec<&Candidate> = ctx.candidates.iter().take(n).collect();
        let sim = consolidation::simulate(ctx.inputs, ctx.volume, &prefix);
        if !sim.scheduled {
            return None;
        }
        let old_price: f64 = prefix.iter().map(|c| c.price).sum();
        let viable = sim.new_nodes.len() < n
            || (sim.new_nodes.len() == n && sim.total_price() < old_price);
        // Consolidating into as many nodes as were removed only ever makes
        // sense for a strictly cheaper single shape; anything wider churns.
        if !viable || sim.new_nodes.len() > 1 {
            return None;
        }
        Some(Plan { count: n, sim })
    }

    pub fn compute_command(&self, ctx: &MethodContext) -> Option<Command> {
        if ctx.candidates.len() < 2 {
            return None;
        }
        let deadline = Instant::now() + ctx.timeout;

        // Binary search the largest workable prefix. Candidates are sorted
        // cheapest-to-disrupt first, so a feasible prefix of length n does
        // not guarantee n+1, but infeasibility at n rules out larger n for
        // the same replacement shape; the classic halving applies.
        let mut lo = 2;
        let mut hi = ctx.candidates.len();
        let mut best: Option<Plan> = None;
        while lo <= hi {
            if Instant::now() >= deadline {
                debug!("multi-node consolidation timed out; abandoning");
                return None;
            }
            let mid = (lo + hi) / 2;
            match self.try_prefix(ctx, mid) {
                Some(plan) => {
                    // Prefer the larger prefix; on equal replacement cost
                    // the tie-break (fewer replacements, lexical pool) is
                    // inherent: a larger feasible prefix never adds nodes.
                    best = Some(plan);
                    lo = mid + 1;
                }
                None => {
                    if mid == 0 {
                        break;
                    }
                    hi = mid - 1;
                }
            }
        }

        let plan = best?;
        let prefix: Vec<&Candidate> = ctx.candidates.iter().take(plan.count).collect();
        let replacements = if plan.sim.new_nodes.is_empty() {
            vec![]
        } else {
            consolidation::replacement_claims(&plan.sim.new_nodes, ctx.pools, None)?
        };
        debug!(
            removed = plan.count,
            replacements = replacements.len(),
            "multi-node consolidation plan"
        );
        Some(Command::new(
            DisruptionReason::Underutilized,
            "multi",
            &prefix,
            replacements,
        ))
    }
}
