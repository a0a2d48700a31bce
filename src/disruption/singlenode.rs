//! Single-node consolidation: scan candidates one at a time within a
//! bounded window, looking for a node whose pods fit elsewhere or onto one
//! strictly cheaper replacement.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::candidate::Candidate;
use super::consolidation;
use super::{Command, MethodContext};
use crate::apis::nodepool::{DisruptionReason, NodePool};

pub struct SingleNode;

impl SingleNode {
    pub fn should_disrupt(&self, pool: &NodePool, c: &Candidate, _now: DateTime<Utc>) -> bool {
        !c.is_empty() && consolidation::underutilized_eligible(pool, c)
    }

    pub fn compute_command(&self, ctx: &MethodContext) -> Option<Command> {
        let deadline = Instant::now() + ctx.timeout;
        for c in ctx.candidates {
            if Instant::now() >= deadline {
                debug!("single-node consolidation timed out; abandoning scan");
                return None;
            }
            let sim = consolidation::simulate(ctx.inputs, ctx.volume, &[c]);
            if !sim.scheduled {
                continue;
            }

            // Fewer nodes: everything fits on existing capacity.
            if sim.new_nodes.is_empty() {
                return Some(Command::new(
                    DisruptionReason::Underutilized,
                    "single",
                    &[c],
                    vec![],
                ));
            }

            // Same count, cheaper: a single replacement priced strictly
            // below the node it displaces.
            if sim.new_nodes.len() == 1
                && let Some(replacements) = consolidation::replacement_claims(
                    &sim.new_nodes,
                    ctx.pools,
                    Some(c.price),
                )
            {
                return Some(Command::new(
                    DisruptionReason::Underutilized,
                    "single",
                    &[c],
                    replacements,
                ));
            }
        }
        None
    }
}
