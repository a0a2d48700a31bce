//! The authoritative in-memory view of nodes, node-claims, and their bound
//! pods, kept consistent under out-of-order and duplicate events.

pub mod statenode;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod, PodSpec};
use tracing::debug;

use crate::apis::nodeclaim::NodeClaim;
use crate::apis::nodepool::NodePool;
use crate::resources::{PodId, ResourceSet, pod_is_daemonset, pod_is_terminal, pod_requests};
use statenode::StateNode;

pub use statenode::NOMINATION_WINDOW;

/// Key for a StateNode: the providerID once known, else a provisional key
/// derived from the object that announced the node first.
fn provisional_claim_key(name: &str) -> String {
    format!("nodeclaim/{name}")
}

fn provisional_node_key(name: &str) -> String {
    format!("node/{name}")
}

#[derive(Default)]
struct ClusterInner {
    /// The arena. Everything else points into it by key.
    nodes: HashMap<String, StateNode>,
    node_name_to_key: HashMap<String, String>,
    claim_name_to_key: HashMap<String, String>,
    /// pod → state key it is bound to.
    bindings: HashMap<PodId, String>,
    /// pod → state key it was nominated onto.
    nominated_pods: HashMap<PodId, String>,
    /// Pods with required anti-affinity, for fast recomputation after
    /// deletions.
    anti_affinity_pods: HashMap<PodId, Pod>,
    daemonsets: BTreeMap<String, PodSpec>,
    observed_claims: HashSet<String>,
    consolidated_at: Option<DateTime<Utc>>,
}

/// Process-wide cluster state. One coarse lock; iteration hands out deep
/// copies so no caller can observe partial updates.
#[derive(Default)]
pub struct Cluster {
    inner: RwLock<ClusterInner>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all state. Intended for process lifecycle management, not for
    /// reconcilers.
    pub fn reset(&self) {
        *self.inner.write().unwrap() = ClusterInner::default();
    }

    // ── Event ingestion ─────────────────────────────────────────────

    pub fn update_node_claim(&self, claim: &NodeClaim) {
        let Some(name) = claim.metadata.name.clone() else {
            return;
        };
        let mut inner = self.inner.write().unwrap();
        inner.observed_claims.insert(name.clone());
        let desired_key = claim
            .provider_id()
            .map(str::to_string)
            .unwrap_or_else(|| provisional_claim_key(&name));

        if let Some(old_key) = inner.claim_name_to_key.get(&name).cloned()
            && old_key != desired_key
        {
            // providerID appeared: migrate the provisional entry.
            if let Some(old) = inner.nodes.remove(&old_key) {
                let merged = inner.nodes.entry(desired_key.clone()).or_default();
                merged.node_claim = old.node_claim;
                if merged.node.is_none() {
                    merged.node = old.node;
                }
                merged.marked_for_deletion |= old.marked_for_deletion;
            }
            Self::rekey(&mut inner, &old_key, &desired_key);
        }

        inner
            .claim_name_to_key
            .insert(name.clone(), desired_key.clone());
        let entry = inner.nodes.entry(desired_key).or_default();
        entry.node_claim = Some(claim.clone());
        inner.consolidated_at = None;
        debug!(claim = %name, "tracked node claim");
    }

    pub fn delete_node_claim(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.observed_claims.remove(name);
        let Some(key) = inner.claim_name_to_key.remove(name) else {
            return;
        };
        let remove = match inner.nodes.get_mut(&key) {
            Some(state) => {
                state.node_claim = None;
                state.node.is_none()
            }
            None => false,
        };
        if remove {
            Self::remove_entry(&mut inner, &key);
        }
        inner.consolidated_at = None;
    }

    pub fn update_node(&self, node: &Node) {
        let Some(name) = node.metadata.name.clone() else {
            return;
        };
        let mut inner = self.inner.write().unwrap();
        let provider_id = node.spec.as_ref().and_then(|s| s.provider_id.clone());
        let desired_key = provider_id.unwrap_or_else(|| provisional_node_key(&name));

        if let Some(old_key) = inner.node_name_to_key.get(&name).cloned()
            && old_key != desired_key
        {
            if let Some(old) = inner.nodes.remove(&old_key) {
                let merged = inner.nodes.entry(desired_key.clone()).or_default();
                merged.node = old.node;
                if merged.node_claim.is_none() {
                    merged.node_claim = old.node_claim;
                }
                merged.marked_for_deletion |= old.marked_for_deletion;
            }
            Self::rekey(&mut inner, &old_key, &desired_key);
        }

        inner
            .node_name_to_key
            .insert(name.clone(), desired_key.clone());
        let entry = inner.nodes.entry(desired_key).or_default();
        entry.node = Some(node.clone());
        inner.consolidated_at = None;
        debug!(node = %name, "tracked node");
    }

    pub fn delete_node(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        let Some(key) = inner.node_name_to_key.remove(name) else {
            return;
        };
        let remove = match inner.nodes.get_mut(&key) {
            Some(state) => {
                state.node = None;
                // The StateNode survives while a claim still references the
                // providerID.
                state.node_claim.is_none()
            }
            None => false,
        };
        if remove {
            Self::remove_entry(&mut inner, &key);
        }
        inner.consolidated_at = None;
    }

    pub fn update_pod(&self, pod: &Pod) {
        let id = PodId::from_pod(pod);
        let mut inner = self.inner.write().unwrap();

        if pod_is_terminal(pod) {
            Self::unbind(&mut inner, &id);
            inner.anti_affinity_pods.remove(&id);
            inner.consolidated_at = None;
            return;
        }

        if pod_has_required_anti_affinity(pod) {
            inner.anti_affinity_pods.insert(id.clone(), pod.clone());
        } else {
            inner.anti_affinity_pods.remove(&id);
        }

        let node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone());
        match node_name {
            Some(node_name) => {
                let key = inner
                    .node_name_to_key
                    .get(&node_name)
                    .cloned()
                    .unwrap_or_else(|| {
                        // Binding raced ahead of the Node event; track under
                        // a provisional key that the Node will merge into.
                        let key = provisional_node_key(&node_name);
                        inner
                            .node_name_to_key
                            .insert(node_name.clone(), key.clone());
                        key
                    });
                if let Some(old_key) = inner.bindings.get(&id).cloned()
                    && old_key != key
                    && let Some(old_state) = inner.nodes.get_mut(&old_key)
                {
                    old_state.remove_pod(&id);
                }
                let requests = pod_requests(pod).unwrap_or_default();
                inner.bindings.insert(id.clone(), key.clone());
                inner
                    .nodes
                    .entry(key)
                    .or_default()
                    .add_pod(id, requests, pod_is_daemonset(pod));
                inner.consolidated_at = None;
            }
            None => {
                Self::unbind(&mut inner, &id);
            }
        }
    }

    pub fn delete_pod(&self, namespace: &str, name: &str) {
        let id = PodId {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        let mut inner = self.inner.write().unwrap();
        Self::unbind(&mut inner, &id);
        inner.anti_affinity_pods.remove(&id);
        inner.nominated_pods.remove(&id);
        inner.consolidated_at = None;
    }

    pub fn update_daemonset(&self, ds: &DaemonSet) {
        let key = format!(
            "{}/{}",
            ds.metadata.namespace.as_deref().unwrap_or("default"),
            ds.metadata.name.as_deref().unwrap_or_default()
        );
        let spec = ds
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.clone());
        let mut inner = self.inner.write().unwrap();
        match spec {
            Some(spec) => {
                inner.daemonsets.insert(key, spec);
            }
            None => {
                inner.daemonsets.remove(&key);
            }
        }
    }

    pub fn delete_daemonset(&self, namespace: &str, name: &str) {
        self.inner
            .write()
            .unwrap()
            .daemonsets
            .remove(&format!("{namespace}/{name}"));
    }

    /// A NodePool spec change invalidates any cached "nothing to
    /// consolidate" conclusion.
    pub fn update_node_pool(&self, _pool: &NodePool) {
        self.inner.write().unwrap().consolidated_at = None;
    }

    fn unbind(inner: &mut ClusterInner, id: &PodId) {
        if let Some(key) = inner.bindings.remove(id)
            && let Some(state) = inner.nodes.get_mut(&key)
        {
            state.remove_pod(id);
        }
    }

    fn rekey(inner: &mut ClusterInner, old_key: &str, new_key: &str) {
        for key in inner.bindings.values_mut() {
            if key == old_key {
                *key = new_key.to_string();
            }
        }
        for key in inner.nominated_pods.values_mut() {
            if key == old_key {
                *key = new_key.to_string();
            }
        }
        for key in inner.node_name_to_key.values_mut() {
            if key == old_key {
                *key = new_key.to_string();
            }
        }
        for key in inner.claim_name_to_key.values_mut() {
            if key == old_key {
                *key = new_key.to_string();
            }
        }
    }

    fn remove_entry(inner: &mut ClusterInner, key: &str) {
        inner.nodes.remove(key);
        inner.bindings.retain(|_, k| k != key);
        inner.nominated_pods.retain(|_, k| k != key);
        inner.node_name_to_key.retain(|_, k| k != key);
        inner.claim_name_to_key.retain(|_, k| k != key);
    }

    // ── Disruption bookkeeping ──────────────────────────────────────

    /// Idempotent: marking an already-marked node is a no-op.
    pub fn mark_for_deletion(&self, provider_ids: &[String]) {
        let mut inner = self.inner.write().unwrap();
        for id in provider_ids {
            if let Some(state) = inner.nodes.get_mut(id) {
                state.marked_for_deletion = true;
            }
        }
        inner.consolidated_at = None;
    }

    pub fn unmark_for_deletion(&self, provider_ids: &[String]) {
        let mut inner = self.inner.write().unwrap();
        for id in provider_ids {
            if let Some(state) = inner.nodes.get_mut(id) {
                state.marked_for_deletion = false;
            }
        }
        inner.consolidated_at = None;
    }

    /// Record that a pending pod is expected to land on this node, shielding
    /// the node from disruption for the nomination window.
    pub fn nominate(&self, pod: PodId, state_key: &str, now: DateTime<Utc>) {
        let mut inner = self.inner.write().unwrap();
        if let Some(state) = inner.nodes.get_mut(state_key) {
            state.nominate(now);
            inner.nominated_pods.insert(pod, state_key.to_string());
        }
    }

    pub fn nominated_node_for(&self, pod: &PodId) -> Option<String> {
        self.inner.read().unwrap().nominated_pods.get(pod).cloned()
    }

    // ── Consolidation cache ─────────────────────────────────────────

    pub fn mark_consolidated(&self, now: DateTime<Utc>) {
        self.inner.write().unwrap().consolidated_at = Some(now);
    }

    /// True while the last "nothing to consolidate" verdict is still fresh
    /// and nothing has changed since.
    pub fn consolidated(&self, now: DateTime<Utc>) -> bool {
        self.inner
            .read()
            .unwrap()
            .consolidated_at
            .map(|at| now - at < chrono::Duration::minutes(5))
            .unwrap_or(false)
    }

    // ── Sync gate ───────────────────────────────────────────────────

    /// True only when every live NodeClaim has been observed and, for each
    /// one with a providerID, the matching Node (if any) is tracked.
    /// Disruption must not act on a partial mirror.
    pub fn synced(&self, live_claims: &[NodeClaim], live_nodes: &[Node]) -> bool {
        let inner = self.inner.read().unwrap();
        for claim in live_claims {
            let Some(name) = claim.metadata.name.as_deref() else {
                continue;
            };
            if !inner.observed_claims.contains(name) {
                return false;
            }
            if let Some(pid) = claim.provider_id()
                && !inner.nodes.contains_key(pid)
            {
                return false;
            }
        }
        for node in live_nodes {
            let Some(name) = node.metadata.name.as_deref() else {
                continue;
            };
            if !inner.node_name_to_key.contains_key(name) {
                return false;
            }
        }
        true
    }

    // ── Snapshots (deep copies) ─────────────────────────────────────

    pub fn nodes(&self) -> Vec<StateNode> {
        self.inner.read().unwrap().nodes.values().cloned().collect()
    }

    /// Snapshot with the arena keys, sorted by key for deterministic
    /// iteration downstream.
    pub fn nodes_with_keys(&self) -> Vec<(String, StateNode)> {
        let mut out: Vec<(String, StateNode)> = self
            .inner
            .read()
            .unwrap()
            .nodes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().unwrap().nodes.len()
    }

    pub fn node_by_key(&self, key: &str) -> Option<StateNode> {
        self.inner.read().unwrap().nodes.get(key).cloned()
    }

    pub fn node_by_provider_id(&self, provider_id: &str) -> Option<StateNode> {
        self.node_by_key(provider_id)
    }

    pub fn anti_affinity_pods(&self) -> Vec<Pod> {
        self.inner
            .read()
            .unwrap()
            .anti_affinity_pods
            .values()
            .cloned()
            .collect()
    }

    pub fn daemonset_pod_specs(&self) -> Vec<PodSpec> {
        self.inner
            .read()
            .unwrap()
            .daemonsets
            .values()
            .cloned()
            .collect()
    }

    /// Daemon-set scheduling overhead for a node matching `labels`: the sum
    /// of requests of every cached daemon-set pod spec that tolerates the
    /// labels' implied constraints.
    pub fn daemonset_overhead(&self, labels: &BTreeMap<String, String>) -> ResourceSet {
        let mut total = ResourceSet::new();
        for spec in self.daemonset_pod_specs() {
            let selector_ok = spec
                .node_selector
                .as_ref()
                .map(|sel| sel.iter().all(|(k, v)| labels.get(k) == Some(v)))
                .unwrap_or(true);
            if !selector_ok {
                continue;
            }
            let pod = Pod {
                spec: Some(spec),
                ..Default::default()
            };
            if let Ok(requests) = pod_requests(&pod) {
                total.add(&requests);
            }
        }
        total
    }
}

pub fn pod_has_required_anti_affinity(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.pod_anti_affinity.as_ref())
        .and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref())
        .map(|terms| !terms.is_empty())
        .unwrap_or(false)
}
