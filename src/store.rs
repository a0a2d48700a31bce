//! The declarative-store port.
//!
//! Everything the core reads or writes in the cluster goes through
//! [`Store`]: a kube-client implementation for real clusters and an
//! in-memory fake for tests, as one tagged enum per the provider port.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod, Taint};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;

use crate::apis::nodeclaim::NodeClaim;
use crate::apis::nodepool::NodePool;
use crate::resources::PodId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("write conflict on {kind} {name:?}")]
    Conflict { kind: &'static str, name: String },

    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

impl StoreError {
    fn from_kube(kind: &'static str, name: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(e) if e.code == 404 => Self::NotFound {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(e) if e.code == 409 => Self::Conflict {
                kind,
                name: name.to_string(),
            },
            _ => Self::Api(err.into()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Api(_) | Self::Conflict { .. })
    }
}

/// Result of one eviction attempt, folded into the port's status taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub enum EvictOutcome {
    Evicted,
    /// 404 — the pod is already gone; counts as success.
    Gone,
    /// 429 — a PodDisruptionBudget is holding the pod; retry later.
    Blocked,
    Transient(String),
}

pub enum Store {
    Kube(KubeStore),
    Fake(FakeStore),
}

macro_rules! dispatch {
    ($self:ident, $p:ident => $body:expr) => {
        match $self {
            Store::Kube($p) => $body,
            Store::Fake($p) => $body,
        }
    };
}

impl Store {
    pub async fn list_pods(&self) -> Result<Vec<Pod>, StoreError> {
        dispatch!(self, p => p.list_pods().await)
    }

    /// Pods that are Pending with an Unschedulable PodScheduled condition,
    /// excluding daemon-set pods.
    pub async fn list_pending_pods(&self) -> Result<Vec<Pod>, StoreError> {
        let pods = self.list_pods().await?;
        Ok(pods
            .into_iter()
            .filter(|pod| {
                let is_unschedulable = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conditions| {
                        conditions.iter().any(|c| {
                            c.type_ == "PodScheduled"
                                && c.status == "False"
                                && c.reason.as_deref() == Some("Unschedulable")
                        })
                    })
                    .unwrap_or(false);
                is_unschedulable
                    && !crate::resources::pod_is_daemonset(pod)
                    && pod.spec.as_ref().and_then(|s| s.node_name.as_ref()).is_none()
            })
            .collect())
    }

    pub async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, StoreError> {
        let pods = self.list_pods().await?;
        Ok(pods
            .into_iter()
            .filter(|p| {
                p.spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    .map(|n| n == node_name)
                    .unwrap_or(false)
            })
            .collect())
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        dispatch!(self, p => p.list_nodes().await)
    }

    pub async fn list_node_claims(&self) -> Result<Vec<NodeClaim>, StoreError> {
        dispatch!(self, p => p.list_node_claims().await)
    }

    pub async fn get_node_claim(&self, name: &str) -> Result<NodeClaim, StoreError> {
        dispatch!(self, p => p.get_node_claim(name).await)
    }

    pub async fn create_node_claim(&self, claim: &NodeClaim) -> Result<NodeClaim, StoreError> {
        dispatch!(self, p => p.create_node_claim(claim).await)
    }

    pub async fn update_node_claim_status(&self, claim: &NodeClaim) -> Result<(), StoreError> {
        dispatch!(self, p => p.update_node_claim_status(claim).await)
    }

    /// Persist a realized claim: metadata (labels the provider stamped)
    /// and status together.
    pub async fn update_node_claim(&self, claim: &NodeClaim) -> Result<(), StoreError> {
        dispatch!(self, p => p.update_node_claim(claim).await)
    }

    pub async fn delete_node_claim(&self, name: &str) -> Result<(), StoreError> {
        dispatch!(self, p => p.delete_node_claim(name).await)
    }

    pub async fn list_node_pools(&self) -> Result<Vec<NodePool>, StoreError> {
        dispatch!(self, p => p.list_node_pools().await)
    }

    pub async fn get_node_pool(&self, name: &str) -> Result<NodePool, StoreError> {
        dispatch!(self, p => p.get_node_pool(name).await)
    }

    pub async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>, StoreError> {
        dispatch!(self, p => p.list_daemon_sets().await)
    }

    pub async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, StoreError> {
        dispatch!(self, p => p.get_pvc(namespace, name).await)
    }

    pub async fn get_pv(&self, name: &str) -> Result<PersistentVolume, StoreError> {
        dispatch!(self, p => p.get_pv(name).await)
    }

    pub async fn get_storage_class(&self, name: &str) -> Result<StorageClass, StoreError> {
        dispatch!(self, p => p.get_storage_class(name).await)
    }

    pub async fn add_node_taint(&self, node_name: &str, taint: Taint) -> Result<(), StoreError> {
        dispatch!(self, p => p.add_node_taint(node_name, taint).await)
    }

    pub async fn remove_node_taint(&self, node_name: &str, key: &str) -> Result<(), StoreError> {
        dispatch!(self, p => p.remove_node_taint(node_name, key).await)
    }

    pub async fn cordon_node(&self, node_name: &str) -> Result<(), StoreError> {
        dispatch!(self, p => p.cordon_node(node_name).await)
    }

    /// Lift the termination finalizer once drain has completed, allowing a
    /// pending deletion to proceed.
    pub async fn remove_node_finalizer(&self, node_name: &str) -> Result<(), StoreError> {
        dispatch!(self, p => p.remove_node_finalizer(node_name).await)
    }

    pub async fn delete_node(&self, name: &str) -> Result<(), StoreError> {
        dispatch!(self, p => p.delete_node(name).await)
    }

    pub async fn evict_pod(&self, pod: &Pod) -> EvictOutcome {
        dispatch!(self, p => p.evict_pod(pod).await)
    }
}

// ── Kube-backed implementation ──────────────────────────────────────

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, StoreError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::Api(e.into()))?;
        Ok(list.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::Api(e.into()))?;
        Ok(list.items)
    }

    async fn list_node_claims(&self) -> Result<Vec<NodeClaim>, StoreError> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::Api(e.into()))?;
        Ok(list.items)
    }

    async fn get_node_claim(&self, name: &str) -> Result<NodeClaim, StoreError> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube("NodeClaim", name, e))
    }

    async fn create_node_claim(&self, claim: &NodeClaim) -> Result<NodeClaim, StoreError> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        let name = claim.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), claim)
            .await
            .map_err(|e| StoreError::from_kube("NodeClaim", &name, e))
    }

    async fn update_node_claim_status(&self, claim: &NodeClaim) -> Result<(), StoreError> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        let name = claim.metadata.name.clone().unwrap_or_default();
        let status = json!({ "status": claim.status });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
            .await
            .map_err(|e| StoreError::from_kube("NodeClaim", &name, e))?;
        Ok(())
    }

    async fn update_node_claim(&self, claim: &NodeClaim) -> Result<(), StoreError> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        let name = claim.metadata.name.clone().unwrap_or_default();
        let metadata = json!({ "metadata": { "labels": claim.metadata.labels } });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&metadata))
            .await
            .map_err(|e| StoreError::from_kube("NodeClaim", &name, e))?;
        self.update_node_claim_status(claim).await
    }

    async fn delete_node_claim(&self, name: &str) -> Result<(), StoreError> {
        let api: Api<NodeClaim> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| StoreError::from_kube("NodeClaim", name, e))?;
        Ok(())
    }

    async fn list_node_pools(&self) -> Result<Vec<NodePool>, StoreError> {
        let api: Api<NodePool> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::Api(e.into()))?;
        Ok(list.items)
    }

    async fn get_node_pool(&self, name: &str) -> Result<NodePool, StoreError> {
        let api: Api<NodePool> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube("NodePool", name, e))
    }

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>, StoreError> {
        let api: Api<DaemonSet> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::Api(e.into()))?;
        Ok(list.items)
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, StoreError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube("PersistentVolumeClaim", name, e))
    }

    async fn get_pv(&self, name: &str) -> Result<PersistentVolume, StoreError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube("PersistentVolume", name, e))
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, StoreError> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| StoreError::from_kube("StorageClass", name, e))
    }

    async fn add_node_taint(&self, node_name: &str, taint: Taint) -> Result<(), StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node = api
            .get(node_name)
            .await
            .map_err(|e| StoreError::from_kube("Node", node_name, e))?;
        let mut taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default();
        if taints.iter().any(|t| t.key == taint.key) {
            return Ok(());
        }
        taints.push(taint);
        let patch = json!({ "spec": { "taints": taints } });
        api.patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube("Node", node_name, e))?;
        Ok(())
    }

    async fn remove_node_taint(&self, node_name: &str, key: &str) -> Result<(), StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node = match api.get(node_name).await {
            Ok(node) => node,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(StoreError::from_kube("Node", node_name, e)),
        };
        let taints: Vec<Taint> = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|t| t.key != key)
            .collect();
        let patch = json!({ "spec": { "taints": taints } });
        api.patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube("Node", node_name, e))?;
        Ok(())
    }

    async fn cordon_node(&self, node_name: &str) -> Result<(), StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.cordon(node_name)
            .await
            .map_err(|e| StoreError::from_kube("Node", node_name, e))?;
        Ok(())
    }

    async fn remove_node_finalizer(&self, node_name: &str) -> Result<(), StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node = match api.get(node_name).await {
            Ok(node) => node,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(StoreError::from_kube("Node", node_name, e)),
        };
        let finalizers: Vec<String> = node
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != crate::apis::FINALIZER_TERMINATION)
            .collect();
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        api.patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube("Node", node_name, e))?;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), StoreError> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(StoreError::from_kube("Node", name, e)),
        }
    }

    async fn evict_pod(&self, pod: &Pod) -> EvictOutcome {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.evict(name, &EvictParams::default()).await {
            Ok(_) => EvictOutcome::Evicted,
            Err(kube::Error::Api(e)) if e.code == 404 => EvictOutcome::Gone,
            Err(kube::Error::Api(e)) if e.code == 429 => EvictOutcome::Blocked,
            Err(e) => EvictOutcome::Transient(e.to_string()),
        }
    }
}

// ── In-memory fake ──────────────────────────────────────────────────

#[derive(Default)]
struct FakeStoreState {
    pods: BTreeMap<String, Pod>,
    nodes: BTreeMap<String, Node>,
    node_claims: BTreeMap<String, NodeClaim>,
    node_pools: BTreeMap<String, NodePool>,
    daemon_sets: BTreeMap<String, DaemonSet>,
    pvcs: BTreeMap<String, PersistentVolumeClaim>,
    pvs: BTreeMap<String, PersistentVolume>,
    storage_classes: BTreeMap<String, StorageClass>,
    evict_blocked: HashMap<String, usize>,
    evicted: Vec<PodId>,
    deleted_claims: Vec<String>,
    deleted_nodes: Vec<String>,
}

/// Deterministic in-memory store. Evictions delete the pod immediately
/// unless a PDB block is scripted with [`FakeStore::block_eviction`].
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<FakeStoreState>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, pod: Pod) {
        let id = PodId::from_pod(&pod).to_string();
        self.state.lock().unwrap().pods.insert(id, pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .pods
            .remove(&format!("{namespace}/{name}"));
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().nodes.insert(name, node);
    }

    pub fn add_node_claim(&self, claim: NodeClaim) {
        let name = claim.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().node_claims.insert(name, claim);
    }

    pub fn add_node_pool(&self, pool: NodePool) {
        let name = pool.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().node_pools.insert(name, pool);
    }

    pub fn add_daemon_set(&self, ds: DaemonSet) {
        let name = ds.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().daemon_sets.insert(name, ds);
    }

    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        let key = format!(
            "{}/{}",
            pvc.metadata.namespace.as_deref().unwrap_or("default"),
            pvc.metadata.name.as_deref().unwrap_or_default()
        );
        self.state.lock().unwrap().pvcs.insert(key, pvc);
    }

    pub fn add_pv(&self, pv: PersistentVolume) {
        let name = pv.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().pvs.insert(name, pv);
    }

    pub fn add_storage_class(&self, sc: StorageClass) {
        let name = sc.metadata.name.clone().unwrap_or_default();
        self.state.lock().unwrap().storage_classes.insert(name, sc);
    }

    /// The next `count` evictions of this pod return [`EvictOutcome::Blocked`].
    pub fn block_eviction(&self, namespace: &str, name: &str, count: usize) {
        self.state
            .lock()
            .unwrap()
            .evict_blocked
            .insert(format!("{namespace}/{name}"), count);
    }

    /// Drop a claim without recording a deletion, as if another actor
    /// removed it out-of-band.
    pub fn remove_claim(&self, name: &str) {
        self.state.lock().unwrap().node_claims.remove(name);
    }

    /// Flip a condition on a stored claim, as the node-lifecycle controller
    /// would.
    pub fn set_claim_condition(&self, name: &str, type_: &str, status: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(claim) = state.node_claims.get_mut(name) {
            claim.set_condition(type_, status, "Test", "", chrono::Utc::now());
        }
    }

    pub fn evicted_pods(&self) -> Vec<PodId> {
        self.state.lock().unwrap().evicted.clone()
    }

    pub fn deleted_claims(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_claims.clone()
    }

    pub fn deleted_nodes(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_nodes.clone()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().unwrap().nodes.get(name).cloned()
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, StoreError> {
        Ok(self.state.lock().unwrap().pods.values().cloned().collect())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.state.lock().unwrap().nodes.values().cloned().collect())
    }

    async fn list_node_claims(&self) -> Result<Vec<NodeClaim>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .node_claims
            .values()
            .cloned()
            .collect())
    }

    async fn get_node_claim(&self, name: &str) -> Result<NodeClaim, StoreError> {
        self.state
            .lock()
            .unwrap()
            .node_claims
            .get(name)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "NodeClaim",
                name: name.to_string(),
            })
    }

    async fn create_node_claim(&self, claim: &NodeClaim) -> Result<NodeClaim, StoreError> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if state.node_claims.contains_key(&name) {
            return Err(StoreError::Conflict {
                kind: "NodeClaim",
                name,
            });
        }
        state.node_claims.insert(name, claim.clone());
        Ok(claim.clone())
    }

    async fn update_node_claim_status(&self, claim: &NodeClaim) -> Result<(), StoreError> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        match state.node_claims.get_mut(&name) {
            Some(existing) => {
                existing.status = claim.status.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "NodeClaim",
                name,
            }),
        }
    }

    async fn update_node_claim(&self, claim: &NodeClaim) -> Result<(), StoreError> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        match state.node_claims.get_mut(&name) {
            Some(existing) => {
                *existing = claim.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "NodeClaim",
                name,
            }),
        }
    }

    async fn delete_node_claim(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.deleted_claims.push(name.to_string());
        match state.node_claims.remove(name) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                kind: "NodeClaim",
                name: name.to_string(),
            }),
        }
    }

    async fn list_node_pools(&self) -> Result<Vec<NodePool>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .node_pools
            .values()
            .cloned()
            .collect())
    }

    async fn get_node_pool(&self, name: &str) -> Result<NodePool, StoreError> {
        self.state
            .lock()
            .unwrap()
            .node_pools
            .get(name)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "NodePool",
                name: name.to_string(),
            })
    }

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .daemon_sets
            .values()
            .cloned()
            .collect())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, StoreError> {
        self.state
            .lock()
            .unwrap()
            .pvcs
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "PersistentVolumeClaim",
                name: name.to_string(),
            })
    }

    async fn get_pv(&self, name: &str) -> Result<PersistentVolume, StoreError> {
        self.state
            .lock()
            .unwrap()
            .pvs
            .get(name)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "PersistentVolume",
                name: name.to_string(),
            })
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass, StoreError> {
        self.state
            .lock()
            .unwrap()
            .storage_classes
            .get(name)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "StorageClass",
                name: name.to_string(),
            })
    }

    async fn add_node_taint(&self, node_name: &str, taint: Taint) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let node = state.nodes.get_mut(node_name).ok_or(StoreError::NotFound {
            kind: "Node",
            name: node_name.to_string(),
        })?;
        let spec = node.spec.get_or_insert_with(Default::default);
        let taints = spec.taints.get_or_insert_with(Vec::new);
        if !taints.iter().any(|t| t.key == taint.key) {
            taints.push(taint);
        }
        Ok(())
    }

    async fn remove_node_taint(&self, node_name: &str, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(node_name)
            && let Some(spec) = node.spec.as_mut()
            && let Some(taints) = spec.taints.as_mut()
        {
            taints.retain(|t| t.key != key);
        }
        Ok(())
    }

    async fn cordon_node(&self, node_name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let node = state.nodes.get_mut(node_name).ok_or(StoreError::NotFound {
            kind: "Node",
            name: node_name.to_string(),
        })?;
        node.spec.get_or_insert_with(Default::default).unschedulable = Some(true);
        Ok(())
    }

    async fn remove_node_finalizer(&self, node_name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(node) = state.nodes.get_mut(node_name) else {
            return Ok(());
        };
        if let Some(finalizers) = node.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != crate::apis::FINALIZER_TERMINATION);
        }
        // A terminating object with no finalizers left is gone.
        let finalizers_empty = node
            .metadata
            .finalizers
            .as_ref()
            .map(|f| f.is_empty())
            .unwrap_or(true);
        if finalizers_empty && node.metadata.deletion_timestamp.is_some() {
            state.nodes.remove(node_name);
            state.deleted_nodes.push(node_name.to_string());
        }
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(node) = state.nodes.get_mut(name) else {
            return Ok(());
        };
        let has_finalizers = node
            .metadata
            .finalizers
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if has_finalizers {
            // Deletion is held open until the finalizers are lifted.
            node.metadata.deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                    crate::apis::nodeclaim::chrono_to_jiff(chrono::Utc::now()),
                ),
            );
            return Ok(());
        }
        state.nodes.remove(name);
        state.deleted_nodes.push(name.to_string());
        Ok(())
    }

    async fn evict_pod(&self, pod: &Pod) -> EvictOutcome {
        let id = PodId::from_pod(pod);
        let key = id.to_string();
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.evict_blocked.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return EvictOutcome::Blocked;
            }
        }
        if state.pods.remove(&key).is_none() {
            return EvictOutcome::Gone;
        }
        state.evicted.push(id);
        EvictOutcome::Evicted
    }
}
