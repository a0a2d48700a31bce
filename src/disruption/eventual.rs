//! The eventual-disruption method: drifted and expired nodes are replaced
//! as soon as a valid plan exists, oldest condition first. Expiration
//! outranks drift when both are true.

use chrono::{DateTime, Utc};

use super::candidate::Candidate;
use super::consolidation;
use super::{Command, MethodContext};
use crate::apis::nodeclaim::{condition, jiff_to_chrono};
use crate::apis::nodepool::{DisruptionReason, NodePool};

pub struct Eventual;

impl Eventual {
    pub fn should_disrupt(&self, _pool: &NodePool, c: &Candidate, _now: DateTime<Utc>) -> bool {
        c.state
            .node_claim
            .as_ref()
            .map(|claim| {
                claim.condition_is_true(condition::EXPIRED)
                    || claim.condition_is_true(condition::DRIFTED)
            })
            .unwrap_or(false)
    }

    pub fn candidate_reason(&self, c: &Candidate) -> DisruptionReason {
        let expired = c
            .state
            .node_claim
            .as_ref()
            .map(|claim| claim.condition_is_true(condition::EXPIRED))
            .unwrap_or(false);
        if expired {
            DisruptionReason::Expired
        } else {
            DisruptionReason::Drifted
        }
    }

    fn condition_age(&self, c: &Candidate) -> DateTime<Utc> {
        let claim = c.state.node_claim.as_ref();
        let reason_condition = match self.candidate_reason(c) {
            DisruptionReason::Expired => condition::EXPIRED,
            _ => condition::DRIFTED,
        };
        claim
            .and_then(|cl| cl.status_condition(reason_condition))
            .map(|cond| jiff_to_chrono(cond.last_transition_time.0))
            .unwrap_or_else(Utc::now)
    }

    pub fn compute_command(&self, ctx: &MethodContext) -> Option<Command> {
        let mut ordered: Vec<&Candidate> = ctx.candidates.iter().collect();
        ordered.sort_by(|a, b| {
            self.condition_age(a)
                .cmp(&self.condition_age(b))
                .then_with(|| a.state_key.cmp(&b.state_key))
        });

        // Empties batch into one cheap delete.
        let empties: Vec<&Candidate> = ordered.iter().copied().filter(|c| c.is_empty()).collect();
        if !empties.is_empty() {
            let reason = self.candidate_reason(empties[0]);
            return Some(Command::new(reason, "", &empties, vec![]));
        }

        // Non-empties replace one at a time to contain the blast radius;
        // the first candidate with a valid rescheduling plan wins.
        for c in ordered {
            let sim = consolidation::simulate(ctx.inputs, ctx.volume, &[c]);
            if !sim.scheduled {
                continue;
            }
            let Some(replacements) =
                consolidation::replacement_claims(&sim.new_nodes, ctx.pools, None)
            else {
                continue;
            };
            let reason = self.candidate_reason(c);
            return Some(Command::new(reason, "", &[c], replacements));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disruption::candidate::build_candidate;
    use crate::providers::kwok;
    use crate::state::statenode::StateNode;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use crate::apis::nodeclaim::chrono_to_jiff;
    use std::collections::BTreeMap;

    fn candidate_with(drifted: bool, expired: bool, now: DateTime<Utc>) -> Candidate {
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
        claim.metadata.labels = Some(labels);
        claim.metadata.creation_timestamp = Some(Time(chrono_to_jiff(now - chrono::Duration::hours(2))));
        claim.set_condition(condition::INITIALIZED, true, "Initialized", "", now);
        if drifted {
            claim.set_condition(condition::DRIFTED, true, "ImageDrift", "", now);
        }
        if expired {
            claim.set_condition(condition::EXPIRED, true, "TTLExpired", "", now);
        }
        claim.status.as_mut().unwrap().provider_id = Some("fake:///1".to_string());

        build_candidate(
            "fake:///1",
            &StateNode::new(None, Some(claim)),
            &BTreeMap::from([(
                "default".to_string(),
                crate::apis::nodepool::NodePool::new("default", Default::default()),
            )]),
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
    fn expired_outranks_drifted() {
        let now = Utc::now();
        let both = candidate_with(true, true, now);
        assert_eq!(Eventual.candidate_reason(&both), DisruptionReason::Expired);

        let drift_only = candidate_with(true, false, now);
        assert_eq!(
            Eventual.candidate_reason(&drift_only),
            DisruptionReason::Drifted
        );
    }

    #[test]
    fn healthy_candidate_is_not_eventual() {
        let now = Utc::now();
        let healthy = candidate_with(false, false, now);
        let pool = crate::apis::nodepool::NodePool::new("default", Default::default());
        assert!(!Eventual.should_disrupt(&pool, &healthy, now));
        assert!(Eventual.should_disrupt(&pool, &candidate_with(true, false, now), now));
    }
}
