//! The in-memory union of a Node and/or NodeClaim sharing a providerID.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Taint};

use crate::apis::nodeclaim::{NodeClaim, condition};
use crate::resources::{PodId, ResourceSet};

/// How long a nomination shields a node from disruption.
pub const NOMINATION_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct StateNode {
    pub node: Option<Node>,
    pub node_claim: Option<NodeClaim>,
    pod_requests: BTreeMap<PodId, ResourceSet>,
    daemonset_requests: BTreeMap<PodId, ResourceSet>,
    pub marked_for_deletion: bool,
    nominated_until: Option<DateTime<Utc>>,
}

impl StateNode {
    pub fn new(node: Option<Node>, node_claim: Option<NodeClaim>) -> Self {
        Self {
            node,
            node_claim,
            ..Default::default()
        }
    }

    pub fn provider_id(&self) -> Option<String> {
        self.node
            .as_ref()
            .and_then(|n| n.spec.as_ref())
            .and_then(|s| s.provider_id.clone())
            .or_else(|| {
                self.node_claim
                    .as_ref()
                    .and_then(|c| c.provider_id().map(str::to_string))
            })
    }

    pub fn node_name(&self) -> Option<String> {
        self.node.as_ref().and_then(|n| n.metadata.name.clone())
    }

    pub fn claim_name(&self) -> Option<String> {
        self.node_claim
            .as_ref()
            .and_then(|c| c.metadata.name.clone())
    }

    /// Display name: the Node's when it exists, else the claim's.
    pub fn name(&self) -> String {
        self.node_name()
            .or_else(|| self.claim_name())
            .unwrap_or_default()
    }

    /// Claim labels first, Node labels override once the node exists.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self
            .node_claim
            .as_ref()
            .map(|c| c.labels())
            .unwrap_or_default();
        if let Some(node) = &self.node {
            for (k, v) in node.metadata.labels.iter().flatten() {
                labels.insert(k.clone(), v.clone());
            }
        }
        labels
    }

    pub fn pool_name(&self) -> Option<String> {
        self.labels().get(crate::apis::LABEL_NODEPOOL).cloned()
    }

    pub fn registered(&self) -> bool {
        self.provider_id().is_some()
    }

    /// A managed node is initialized when its claim says so. Nodes without
    /// a claim predate us; they count as initialized once Ready so their
    /// capacity participates in scheduling.
    pub fn initialized(&self) -> bool {
        match &self.node_claim {
            Some(claim) => claim.is_initialized(),
            None => self.node.is_some() && self.node_ready(),
        }
    }

    pub fn node_ready(&self) -> bool {
        self.node
            .as_ref()
            .and_then(|n| n.status.as_ref())
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }

    fn claim_resources(claim: &NodeClaim, allocatable: bool) -> ResourceSet {
        claim
            .status
            .as_ref()
            .and_then(|s| {
                if allocatable {
                    s.allocatable.as_ref()
                } else {
                    s.capacity.as_ref()
                }
            })
            .and_then(|l| ResourceSet::from_list(l).ok())
            .unwrap_or_default()
    }

    fn node_resources(node: &Node, allocatable: bool) -> ResourceSet {
        node.status
            .as_ref()
            .and_then(|s| {
                if allocatable {
                    s.allocatable.as_ref()
                } else {
                    s.capacity.as_ref()
                }
            })
            .and_then(|l| ResourceSet::from_list(l).ok())
            .unwrap_or_default()
    }

    fn resources(&self, allocatable: bool) -> ResourceSet {
        match (&self.node, &self.node_claim) {
            (None, Some(claim)) => Self::claim_resources(claim, allocatable),
            (Some(node), Some(claim)) if !self.initialized() => {
                // Kubelet reports can lag while the node boots; don't let a
                // low early report shrink the capacity we already promised.
                Self::claim_resources(claim, allocatable)
                    .merge_max(&Self::node_resources(node, allocatable))
            }
            (Some(node), _) => Self::node_resources(node, allocatable),
            (None, None) => ResourceSet::new(),
        }
    }

    pub fn capacity(&self) -> ResourceSet {
        self.resources(false)
    }

    pub fn allocatable(&self) -> ResourceSet {
        self.resources(true)
    }

    pub fn pod_requests_total(&self) -> ResourceSet {
        let mut total = ResourceSet::new();
        for req in self.pod_requests.values() {
            total.add(req);
        }
        for req in self.daemonset_requests.values() {
            total.add(req);
        }
        total
    }

    pub fn daemonset_requests_total(&self) -> ResourceSet {
        let mut total = ResourceSet::new();
        for req in self.daemonset_requests.values() {
            total.add(req);
        }
        total
    }

    /// `allocatable − podRequests`, clamped at zero.
    pub fn available(&self) -> ResourceSet {
        self.allocatable().saturating_sub(&self.pod_requests_total())
    }

    pub fn add_pod(&mut self, id: PodId, requests: ResourceSet, daemonset: bool) {
        // A pod moving between the two maps must not be double counted.
        self.pod_requests.remove(&id);
        self.daemonset_requests.remove(&id);
        if daemonset {
            self.daemonset_requests.insert(id, requests);
        } else {
            self.pod_requests.insert(id, requests);
        }
    }

    pub fn remove_pod(&mut self, id: &PodId) {
        self.pod_requests.remove(id);
        self.daemonset_requests.remove(id);
    }

    pub fn pod_ids(&self) -> Vec<PodId> {
        self.pod_requests
            .keys()
            .chain(self.daemonset_requests.keys())
            .cloned()
            .collect()
    }

    /// Pods that would need rescheduling if this node went away.
    pub fn reschedulable_pod_ids(&self) -> Vec<PodId> {
        self.pod_requests.keys().cloned().collect()
    }

    pub fn pod_count(&self) -> usize {
        self.pod_requests.len() + self.daemonset_requests.len()
    }

    pub fn nominate(&mut self, now: DateTime<Utc>) {
        self.nominated_until = Some(
            now + chrono::Duration::from_std(NOMINATION_WINDOW).unwrap_or_else(|_| chrono::Duration::zero()),
        );
    }

    pub fn nominated(&self, now: DateTime<Utc>) -> bool {
        self.nominated_until.map(|until| now < until).unwrap_or(false)
    }

    /// Effective taints: the live node's once it exists, else what the
    /// claim promises (startup taints included until the node registers).
    pub fn taints(&self) -> Vec<Taint> {
        if let Some(node) = &self.node {
            return node
                .spec
                .as_ref()
                .and_then(|s| s.taints.clone())
                .unwrap_or_default();
        }
        if let Some(claim) = &self.node_claim {
            let mut taints = claim.spec.taints.clone();
            taints.extend(claim.spec.startup_taints.clone());
            return taints;
        }
        vec![]
    }

    pub fn has_annotation(&self, key: &str) -> bool {
        let on = |annotations: Option<&BTreeMap<String, String>>| {
            annotations
                .and_then(|a| a.get(key))
                .map(|v| v == "true")
                .unwrap_or(false)
        };
        on(self
            .node
            .as_ref()
            .and_then(|n| n.metadata.annotations.as_ref()))
            || on(self
                .node_claim
                .as_ref()
                .and_then(|c| c.metadata.annotations.as_ref()))
    }
}

/// The initialization predicate the node-lifecycle collaborator applies: a
/// node is initialized once it is Ready, every startup taint is gone, and
/// each non-zero capacity resource of the instance type shows up as
/// non-zero allocatable (extended resources register late).
pub fn node_initialization_complete(
    node: &Node,
    startup_taints: &[Taint],
    expected_capacity: &ResourceSet,
) -> bool {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    if !ready {
        return false;
    }
    let taints = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .cloned()
        .unwrap_or_default();
    if startup_taints
        .iter()
        .any(|st| taints.iter().any(|t| t.key == st.key && t.effect == st.effect))
    {
        return false;
    }
    let allocatable = node
        .status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|l| ResourceSet::from_list(l).ok())
        .unwrap_or_default();
    expected_capacity
        .iter()
        .all(|(name, amount)| *amount == 0 || allocatable.get(name) > 0)
}

/// Marks a claim's `Initialized` condition from the live node state.
pub fn sync_initialized_condition(
    claim: &mut NodeClaim,
    node: &Node,
    expected_capacity: &ResourceSet,
    now: DateTime<Utc>,
) {
    let done = node_initialization_complete(node, &claim.spec.startup_taints, expected_capacity);
    if done {
        claim.set_condition(condition::INITIALIZED, true, "Initialized", "", now);
    } else {
        claim.set_condition(
            condition::INITIALIZED,
            false,
            "NotReady",
            "node not ready, startup taints present, or resources unregistered",
            now,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn claim_with_resources(cpu: &str) -> NodeClaim {
        let mut claim = NodeClaim::new("claim-a", Default::default());
        claim.status = Some(crate::apis::nodeclaim::NodeClaimStatus {
            provider_id: Some("fake:///1".to_string()),
            capacity: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity(cpu.to_string()),
            )])),
            allocatable: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity(cpu.to_string()),
            )])),
            conditions: vec![],
        });
        claim
    }

    fn ready_node(cpu: &str) -> Node {
        Node {
            metadata: kube::api::ObjectMeta {
                name: Some("node-1".to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some("fake:///1".to_string()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                capacity: Some(BTreeMap::from([(
                    "cpu".to_string(),
                    Quantity(cpu.to_string()),
                )])),
                allocatable: Some(BTreeMap::from([(
                    "cpu".to_string(),
                    Quantity(cpu.to_string()),
                )])),
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn claim_only_uses_claim_resources() {
        let state = StateNode {
            node_claim: Some(claim_with_resources("4")),
            ..Default::default()
        };
        assert_eq!(state.allocatable().get("cpu"), 4000);
    }

    #[test]
    fn uninitialized_pair_takes_per_resource_max() {
        // Node kubelet reports less than the claim promised; keep the max
        // until initialization settles the question.
        let state = StateNode {
            node: Some(ready_node("2")),
            node_claim: Some(claim_with_resources("4")),
            ..Default::default()
        };
        assert!(!state.initialized());
        assert_eq!(state.allocatable().get("cpu"), 4000);
    }

    #[test]
    fn initialized_node_is_authoritative() {
        let mut claim = claim_with_resources("4");
        claim.set_condition(condition::INITIALIZED, true, "Initialized", "", Utc::now());
        let state = StateNode {
            node: Some(ready_node("2")),
            node_claim: Some(claim),
            ..Default::default()
        };
        assert!(state.initialized());
        assert_eq!(state.allocatable().get("cpu"), 2000);
    }

    #[test]
    fn available_is_allocatable_minus_requests() {
        let mut state = StateNode {
            node: Some(ready_node("4")),
            ..Default::default()
        };
        let id = PodId {
            namespace: "default".into(),
            name: "pod-a".into(),
        };
        state.add_pod(id.clone(), ResourceSet::new().with("cpu", 1500), false);
        assert_eq!(state.available().get("cpu"), 2500);

        // Resource math invariant: available + requests == allocatable.
        let mut sum = state.available();
        sum.add(&state.pod_requests_total());
        assert_eq!(sum.get("cpu"), state.allocatable().get("cpu"));

        state.remove_pod(&id);
        assert_eq!(state.available().get("cpu"), 4000);
    }

    #[test]
    fn daemonset_requests_tracked_separately() {
        let mut state = StateNode {
            node: Some(ready_node("4")),
            ..Default::default()
        };
        state.add_pod(
            PodId {
                namespace: "kube-system".into(),
                name: "ds-a".into(),
            },
            ResourceSet::new().with("cpu", 200),
            true,
        );
        state.add_pod(
            PodId {
                namespace: "default".into(),
                name: "pod-a".into(),
            },
            ResourceSet::new().with("cpu", 1000),
            false,
        );
        assert_eq!(state.daemonset_requests_total().get("cpu"), 200);
        assert_eq!(state.pod_requests_total().get("cpu"), 1200);
        assert_eq!(state.reschedulable_pod_ids().len(), 1);
        assert_eq!(state.pod_count(), 2);
    }

    #[test]
    fn nomination_decays() {
        let mut state = StateNode::default();
        let now = Utc::now();
        assert!(!state.nominated(now));
        state.nominate(now);
        assert!(state.nominated(now + chrono::Duration::seconds(5)));
        assert!(!state.nominated(now + chrono::Duration::seconds(11)));
    }

    #[test]
    fn initialization_requires_registered_extended_resources() {
        let node = ready_node("4");
        let expected = ResourceSet::new()
            .with("cpu", 4000)
            .with("nvidia.com/gpu", 1000);
        assert!(!node_initialization_complete(&node, &[], &expected));

        let cpu_only = ResourceSet::new().with("cpu", 4000);
        assert!(node_initialization_complete(&node, &[], &cpu_only));
    }

    #[test]
    fn initialization_blocked_by_startup_taints() {
        let mut node = ready_node("4");
        let startup = Taint {
            key: "node.cloudprovider/uninitialized".to_string(),
            effect: "NoSchedule".to_string(),
            value: None,
            time_added: None,
        };
        node.spec.as_mut().unwrap().taints = Some(vec![startup.clone()]);
        let expected = ResourceSet::new().with("cpu", 4000);
        assert!(!node_initialization_complete(&node, &[startup.clone()], &expected));

        node.spec.as_mut().unwrap().taints = Some(vec![]);
        assert!(node_initialization_complete(&node, &[startup], &expected));
    }
}
