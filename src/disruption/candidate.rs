//! Candidate model: a StateNode weighed for removal.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

use crate::apis;
use crate::apis::nodeclaim::jiff_to_chrono;
use crate::apis::nodepool::{ActionWindow, NodePool};
use crate::providers::provider::InstanceType;
use crate::resources::{PodId, pod_is_daemonset, pod_is_terminal};
use crate::state::statenode::StateNode;

/// Why a node cannot be a disruption candidate right now.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CandidateError {
    #[error("node is not initialized")]
    NotInitialized,

    #[error("node is already marked for deletion")]
    MarkedForDeletion,

    #[error("node is nominated for a pending pod")]
    Nominated,

    #[error("node is annotated do-not-disrupt")]
    DoNotDisrupt,

    #[error("pod {0} is annotated do-not-disrupt")]
    PodBlocksDisruption(PodId),

    #[error("node lacks the {0} label")]
    MissingLabel(&'static str),

    #[error("node pool {0} is unknown")]
    UnknownPool(String),

    #[error("instance type {0} is unknown")]
    UnknownInstanceType(String),

    #[error("node is part of an in-flight disruption command")]
    AlreadyDisrupting,
}

#[derive(Clone, Debug)]
pub struct Candidate {
    pub state_key: String,
    pub state: StateNode,
    pub pool_name: String,
    pub instance_type: String,
    pub capacity_type: String,
    pub zone: String,
    pub reschedulable_pods: Vec<Pod>,
    /// Hourly price of the node's current offering.
    pub price: f64,
    /// Pod-reschedule cost scaled by remaining lifetime; cheap-to-disrupt
    /// candidates sort first.
    pub disruption_cost: f64,
}

impl Candidate {
    pub fn claim_name(&self) -> String {
        self.state.claim_name().unwrap_or_default()
    }

    pub fn node_name(&self) -> String {
        self.state.node_name().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.reschedulable_pods.is_empty()
    }
}

fn pod_reschedule_cost(pod: &Pod) -> f64 {
    let priority = pod
        .spec
        .as_ref()
        .and_then(|s| s.priority)
        .unwrap_or(0)
        .max(0) as f64;
    1.0 + priority / 10_000.0
}

/// Fraction of `expireAfter` the node has left, in [0, 1]. 1 when the pool
/// never expires nodes.
pub fn lifetime_remaining(pool: &NodePool, state: &StateNode, now: DateTime<Utc>) -> f64 {
    let Ok(ActionWindow::After(expire_after)) = pool.spec.disruption.expire_after() else {
        return 1.0;
    };
    let Some(created) = state
        .node_claim
        .as_ref()
        .and_then(|c| c.metadata.creation_timestamp.as_ref())
        .map(|t| jiff_to_chrono(t.0))
    else {
        return 1.0;
    };
    let age = (now - created).num_seconds().max(0) as f64;
    let total = expire_after.as_secs() as f64;
    if total <= 0.0 {
        return 0.0;
    }
    (1.0_f64 - age / total).clamp(0.0, 1.0)
}

#[allow(clippy::too_many_arguments)]
pub fn build_candidate(
    state_key: &str,
    state: &StateNode,
    pools: &BTreeMap<String, NodePool>,
    instance_types: &BTreeMap<String, Vec<InstanceType>>,
    pods_on_node: &[Pod],
    in_command: bool,
    now: DateTime<Utc>,
) -> Result<Candidate, CandidateError> {
    if in_command {
        return Err(CandidateError::AlreadyDisrupting);
    }
    if !state.initialized() {
        return Err(CandidateError::NotInitialized);
    }
    if state.marked_for_deletion {
        return Err(CandidateError::MarkedForDeletion);
    }
    if state.nominated(now) {
        return Err(CandidateError::Nominated);
    }
    if state.has_annotation(apis::ANNOTATION_DO_NOT_DISRUPT) {
        return Err(CandidateError::DoNotDisrupt);
    }

    let labels = state.labels();
    let zone = labels
        .get(apis::LABEL_ZONE)
        .ok_or(CandidateError::MissingLabel(apis::LABEL_ZONE))?
        .clone();
    let capacity_type = labels
        .get(apis::LABEL_CAPACITY_TYPE)
        .ok_or(CandidateError::MissingLabel(apis::LABEL_CAPACITY_TYPE))?
        .clone();
    let instance_type_name = labels
        .get(apis::LABEL_INSTANCE_TYPE)
        .ok_or(CandidateError::MissingLabel(apis::LABEL_INSTANCE_TYPE))?
        .clone();
    let pool_name = labels
        .get(apis::LABEL_NODEPOOL)
        .ok_or(CandidateError::MissingLabel(apis::LABEL_NODEPOOL))?
        .clone();

    let pool = pools
        .get(&pool_name)
        .ok_or_else(|| CandidateError::UnknownPool(pool_name.clone()))?;
    let instance_type = instance_types
        .get(&pool_name)
        .and_then(|catalog| catalog.iter().find(|it| it.name == instance_type_name))
        .ok_or_else(|| CandidateError::UnknownInstanceType(instance_type_name.clone()))?;

    let price = instance_type
        .offerings
        .iter()
        .find(|o| o.capacity_type == capacity_type && o.zone == zone)
        .map(|o| o.price)
        .or_else(|| {
            instance_type
                .offerings
                .iter()
                .map(|o| o.price)
                .min_by(|a, b| a.total_cmp(b))
        })
        .unwrap_or(0.0);

    let mut reschedulable = Vec::new();
    for pod in pods_on_node {
        if pod_is_terminal(pod) || pod_is_daemonset(pod) {
            continue;
        }
        let blocks = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(apis::ANNOTATION_DO_NOT_DISRUPT))
            .map(|v| v == "true")
            .unwrap_or(false);
        if blocks && pod.metadata.deletion_timestamp.is_none() {
            return Err(CandidateError::PodBlocksDisruption(PodId::from_pod(pod)));
        }
        reschedulable.push(pod.clone());
    }

    let cost_sum: f64 = reschedulable.iter().map(pod_reschedule_cost).sum();
    let disruption_cost = cost_sum * lifetime_remaining(pool, state, now);

    Ok(Candidate {
        state_key: state_key.to_string(),
        state: state.clone(),
        pool_name,
        instance_type: instance_type_name,
        capacity_type,
        zone,
        reschedulable_pods: reschedulable,
        price,
        disruption_cost,
    })
}

/// Order candidates cheapest-to-disrupt first, name as tiebreak.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.disruption_cost
            .total_cmp(&b.disruption_cost)
            .then_with(|| a.state_key.cmp(&b.state_key))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::nodeclaim::{NodeClaim, chrono_to_jiff, condition};
    use crate::providers::kwok;
    use k8s_openapi::api::core::v1::{NodeSpec, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn full_labels() -> BTreeMap<String, String> {
        BTreeMap::from([
            (apis::LABEL_ZONE.to_string(), "zone-a".to_string()),
            (
                apis::LABEL_CAPACITY_TYPE.to_string(),
                apis::CAPACITY_TYPE_ON_DEMAND.to_string(),
            ),
            (apis::LABEL_INSTANCE_TYPE.to_string(), "c-2x".to_string()),
            (apis::LABEL_NODEPOOL.to_string(), "default".to_string()),
        ])
    }

    fn state_node(now: DateTime<Utc>) -> StateNode {
        let mut claim = NodeClaim::new("claim-a", Default::default());
        claim.metadata.labels = Some(full_labels());
        claim.metadata.creation_timestamp = Some(Time(chrono_to_jiff(now - chrono::Duration::hours(1))));
        claim.set_condition(condition::INITIALIZED, true, "Initialized", "", now);
        claim.status.as_mut().unwrap().provider_id = Some("fake:///1".to_string());
        StateNode::new(
            Some(k8s_openapi::api::core::v1::Node {
                metadata: kube::api::ObjectMeta {
                    name: Some("node-1".to_string()),
                    labels: Some(full_labels()),
                    ..Default::default()
                },
                spec: Some(NodeSpec {
                    provider_id: Some("fake:///1".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            Some(claim),
        )
    }

    fn pools() -> BTreeMap<String, NodePool> {
        BTreeMap::from([(
            "default".to_string(),
            NodePool::new("default", Default::default()),
        )])
    }

    fn catalogs() -> BTreeMap<String, Vec<InstanceType>> {
        BTreeMap::from([(
            "default".to_string(),
            vec![kwok::instance_type("c-2x", 2, 4_096, 0.01)],
        )])
    }

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        }
    }

    #[test]
    fn healthy_node_is_a_candidate() {
        let now = Utc::now();
        let candidate = build_candidate(
            "fake:///1",
            &state_node(now),
            &pools(),
            &catalogs(),
            &[pod("pod-a")],
            false,
            now,
        )
        .unwrap();
        assert_eq!(candidate.pool_name, "default");
        assert_eq!(candidate.reschedulable_pods.len(), 1);
        assert_eq!(candidate.price, 0.01);
        assert!(candidate.disruption_cost > 0.0);
    }

    #[test]
    fn ineligibility_reasons() {
        let now = Utc::now();

        let mut uninitialized = state_node(now);
        uninitialized.node_claim.as_mut().unwrap().set_condition(
            condition::INITIALIZED,
            false,
            "NotReady",
            "",
            now,
        );
        assert_eq!(
            build_candidate("fake:///1", &uninitialized, &pools(), &catalogs(), &[], false, now)
                .unwrap_err(),
            CandidateError::NotInitialized
        );

        let mut marked = state_node(now);
        marked.marked_for_deletion = true;
        assert_eq!(
            build_candidate("fake:///1", &marked, &pools(), &catalogs(), &[], false, now)
                .unwrap_err(),
            CandidateError::MarkedForDeletion
        );

        let mut nominated = state_node(now);
        nominated.nominate(now);
        assert_eq!(
            build_candidate("fake:///1", &nominated, &pools(), &catalogs(), &[], false, now)
                .unwrap_err(),
            CandidateError::Nominated
        );

        let mut annotated = state_node(now);
        annotated
            .node_claim
            .as_mut()
            .unwrap()
            .metadata
            .annotations = Some(BTreeMap::from([(
            apis::ANNOTATION_DO_NOT_DISRUPT.to_string(),
            "true".to_string(),
        )]));
        assert_eq!(
            build_candidate("fake:///1", &annotated, &pools(), &catalogs(), &[], false, now)
                .unwrap_err(),
            CandidateError::DoNotDisrupt
        );

        assert_eq!(
            build_candidate("fake:///1", &state_node(now), &pools(), &catalogs(), &[], true, now)
                .unwrap_err(),
            CandidateError::AlreadyDisrupting
        );

        assert!(matches!(
            build_candidate(
                "fake:///1",
                &state_node(now),
                &BTreeMap::new(),
                &catalogs(),
                &[],
                false,
                now
            )
            .unwrap_err(),
            CandidateError::UnknownPool(_)
        ));
    }

    #[test]
    fn do_not_disrupt_pod_blocks() {
        let now = Utc::now();
        let mut protected = pod("pod-a");
        protected.metadata.annotations = Some(BTreeMap::from([(
            apis::ANNOTATION_DO_NOT_DISRUPT.to_string(),
            "true".to_string(),
        )]));
        assert!(matches!(
            build_candidate(
                "fake:///1",
                &state_node(now),
                &pools(),
                &catalogs(),
                &[protected],
                false,
                now
            )
            .unwrap_err(),
            CandidateError::PodBlocksDisruption(_)
        ));
    }

    #[test]
    fn lifetime_remaining_scales_cost() {
        let now = Utc::now();
        let mut pool = NodePool::new("default", Default::default());
        pool.spec.disruption.expire_after = Some("2h".to_string());
        // The node is 1h into a 2h lifetime.
        let remaining = lifetime_remaining(&pool, &state_node(now), now);
        assert!((remaining - 0.5).abs() < 0.01);

        pool.spec.disruption.expire_after = None;
        assert_eq!(lifetime_remaining(&pool, &state_node(now), now), 1.0);
    }

    #[test]
    fn sort_is_cost_then_key() {
        let now = Utc::now();
        let cheap = Candidate {
            disruption_cost: 0.5,
            ..build_candidate("fake:///1", &state_node(now), &pools(), &catalogs(), &[], false, now)
                .unwrap()
        };
        let mut pricey = cheap.clone();
        pricey.state_key = "fake:///2".to_string();
        pricey.disruption_cost = 2.0;

        let mut list = vec![pricey, cheap];
        sort_candidates(&mut list);
        assert_eq!(list[0].state_key, "fake:///1");
    }
}
