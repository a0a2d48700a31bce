//! The Empty method: delete nodes with zero reschedulable pods, after the
//! pool's consolidation delay has passed.

use chrono::{DateTime, Utc};

use super::candidate::Candidate;
use super::consolidation;
use super::{Command, MethodContext};
use crate::apis::nodeclaim::condition;
use crate::apis::nodepool::{DisruptionReason, NodePool};

pub struct Emptiness;

impl Emptiness {
    pub fn should_disrupt(&self, pool: &NodePool, c: &Candidate, now: DateTime<Utc>) -> bool {
        if !c.is_empty() || !consolidation::consolidation_enabled(pool) {
            return false;
        }
        let Some(claim) = c.state.node_claim.as_ref() else {
            return false;
        };
        claim.condition_is_true(condition::EMPTY)
            && consolidation::past_consolidate_after(pool, claim, now)
    }

    /// All eligible empties batch into a single delete command; no
    /// replacements.
    pub fn compute_command(&self, ctx: &MethodContext) -> Option<Command> {
        if ctx.candidates.is_empty() {
            return None;
        }
        let refs: Vec<&Candidate> = ctx.candidates.iter().collect();
        Some(Command::new(DisruptionReason::Empty, "empty", &refs, vec![]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::nodepool::ConsolidationPolicy;
    use crate::disruption::candidate::{Candidate, build_candidate};
    use crate::providers::kwok;
    use crate::state::statenode::StateNode;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use crate::apis::nodeclaim::chrono_to_jiff;
    use std::collections::BTreeMap;

    fn pool() -> NodePool {
        let mut pool = NodePool::new("default", Default::default());
        pool.spec.disruption.consolidate_after = Some("30s".to_string());
        pool.spec.disruption.consolidation_policy = ConsolidationPolicy::WhenEmpty;
        pool
    }

    fn empty_candidate(empty_since: DateTime<Utc>, now: DateTime<Utc>) -> Candidate {
        let labels = BTreeMap::from([
            (crate::apis::LABEL_ZONE.to_string(), "zone-a".to_string()),
            (
                crate::apis::LABEL_CAPACITY_TYPE.to_string(),
                "on-demand".to_string(),
            ),
            (
                crate::apis::LABEL_INSTANCE_TYPE.to_string(),
                "c-2x".to_string(),
            ),
            (
                crate::apis::LABEL_NODEPOOL.to_string(),
                "default".to_string(),
            ),
        ]);
        let mut claim = crate::apis::nodeclaim::NodeClaim::new("claim-a", Default::default());
        claim.metadata.labels = Some(labels.clone());
        claim.metadata.creation_timestamp = Some(Time(chrono_to_jiff(now - chrono::Duration::hours(1))));
        claim.set_condition(condition::INITIALIZED, true, "Initialized", "", now);
        claim.set_condition(condition::EMPTY, true, "Empty", "", empty_since);
        claim.status.as_mut().unwrap().provider_id = Some("fake:///1".to_string());

        let state = StateNode::new(None, Some(claim));
        build_candidate(
            "fake:///1",
            &state,
            &BTreeMap::from([("default".to_string(), pool())]),
            &BTreeMap::from([(
                "default".to_string(),
                vec![kwok::instance_type("c-2x", 2, 4_096, 0.01)],
            )]),
            &[],
            false,
            now,
        )
        .unwrap()
    }

    #[test]
    fn waits_out_consolidate_after() {
        let now = Utc::now();
        let method = Emptiness;
        let fresh = empty_candidate(now - chrono::Duration::seconds(5), now);
        assert!(!method.should_disrupt(&pool(), &fresh, now));

        let aged = empty_candidate(now - chrono::Duration::seconds(60), now);
        assert!(method.should_disrupt(&pool(), &aged, now));
    }

    #[test]
    fn never_disables_emptiness() {
        let now = Utc::now();
        let mut never = pool();
        never.spec.disruption.consolidate_after = Some("Never".to_string());
        never.spec.disruption.consolidation_policy = ConsolidationPolicy::WhenUnderutilized;
        let aged = empty_candidate(now - chrono::Duration::minutes(10), now);
        assert!(!Emptiness.should_disrupt(&never, &aged, now));
    }
}
