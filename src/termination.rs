//! Node termination: cordon, drain through the eviction port, then delete
//! the cloud instance.
//!
//! Draining uses evictions so PodDisruptionBudgets are respected. DaemonSet
//! pods are skipped (their controller ignores cordons and would fight us),
//! as are mirror pods, which cannot be controlled at all.

use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::apis;
use crate::apis::nodeclaim::NodeClaim;
use crate::events::{EventSink, Severity};
use crate::providers::provider::{CloudProvider, ProviderError};
use crate::resources::{PodId, pod_is_daemonset, pod_is_terminal};
use crate::store::{EvictOutcome, Store, StoreError};

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

#[derive(Debug, Error)]
pub enum DrainError {
    /// A pod annotated do-not-disrupt is on the node; drain cannot start.
    #[error("pod {0} blocks drain")]
    Blocked(PodId),

    /// A PodDisruptionBudget kept refusing the eviction.
    #[error("eviction of {0} blocked by disruption budget")]
    PdbViolation(PodId),

    #[error("eviction of {0} failed: {1}")]
    Eviction(PodId, String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone)]
pub struct TerminationOptions {
    pub concurrency: usize,
    pub retry_interval: Duration,
    pub max_attempts: usize,
}

impl Default for TerminationOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            retry_interval: Duration::from_secs(5),
            max_attempts: 10,
        }
    }
}

fn pod_blocks_drain(pod: &k8s_openapi::api::core::v1::Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(apis::ANNOTATION_DO_NOT_DISRUPT))
        .map(|v| v == "true")
        .unwrap_or(false)
        && pod.metadata.deletion_timestamp.is_none()
}

fn pod_is_mirror(pod: &k8s_openapi::api::core::v1::Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(MIRROR_POD_ANNOTATION))
        .unwrap_or(false)
}

/// Evict one pod, retrying PDB blocks and transient errors on a fixed
/// cadence.
async fn evict_with_retry(
    store: &Store,
    events: &EventSink,
    pod: &k8s_openapi::api::core::v1::Pod,
    opts: &TerminationOptions,
) -> Result<(), DrainError> {
    let id = PodId::from_pod(pod);
    for attempt in 0..opts.max_attempts {
        match store.evict_pod(pod).await {
            EvictOutcome::Evicted | EvictOutcome::Gone => {
                debug!(pod = %id, attempt, "pod evicted");
                return Ok(());
            }
            EvictOutcome::Blocked => {
                events.emit(
                    Severity::Warning,
                    "EvictionBlocked",
                    &id.to_string(),
                    "pod disruption budget is holding the eviction",
                );
                tokio::time::sleep(opts.retry_interval).await;
            }
            EvictOutcome::Transient(err) => {
                warn!(pod = %id, %err, attempt, "eviction failed; retrying");
                tokio::time::sleep(opts.retry_interval).await;
            }
        }
    }
    // One final look to classify the failure.
    match store.evict_pod(pod).await {
        EvictOutcome::Evicted | EvictOutcome::Gone => Ok(()),
        EvictOutcome::Blocked => Err(DrainError::PdbViolation(id)),
        EvictOutcome::Transient(err) => Err(DrainError::Eviction(id, err)),
    }
}

/// Cordon the node and evict everything reschedulable off it.
pub async fn drain_node(
    store: &Store,
    events: &EventSink,
    node_name: &str,
    opts: &TerminationOptions,
) -> Result<(), DrainError> {
    store.cordon_node(node_name).await?;

    let pods = store.list_pods_on_node(node_name).await?;
    let targets: Vec<_> = pods
        .into_iter()
        .filter(|p| !pod_is_daemonset(p) && !pod_is_mirror(p) && !pod_is_terminal(p))
        .collect();

    // Do-not-disrupt pods block the whole drain, before anything is
    // evicted.
    if let Some(blocker) = targets.iter().find(|p| pod_blocks_drain(p)) {
        return Err(DrainError::Blocked(PodId::from_pod(blocker)));
    }

    info!(node = node_name, pods = targets.len(), "draining node");
    let failures: Vec<DrainError> = stream::iter(targets)
        .map(|pod| async move { evict_with_retry(store, events, &pod, opts).await })
        .buffer_unordered(opts.concurrency.max(1))
        .filter_map(|r| async move { r.err() })
        .collect()
        .await;

    match failures.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Full termination: drain, delete the cloud instance, then lift the
/// termination finalizer so the Node object can go. The finalizer is what
/// holds any earlier deletion open until the drain has completed;
/// instance-already-gone is success.
pub async fn terminate_node(
    store: &Store,
    provider: &CloudProvider,
    events: &EventSink,
    claim: &NodeClaim,
    node_name: &str,
    opts: &TerminationOptions,
) -> Result<(), DrainError> {
    drain_node(store, events, node_name, opts).await?;
    match provider.delete(claim).await {
        Ok(()) => {}
        Err(ProviderError::NotFound(_)) => {}
        Err(err) => return Err(err.into()),
    }
    store.remove_node_finalizer(node_name).await?;
    store.delete_node(node_name).await?;
    info!(node = node_name, "node terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FakeStore;
    use k8s_openapi::api::core::v1::{Pod, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use std::collections::BTreeMap;

    fn pod_on(node: &str, name: &str) -> Pod {
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(name: &str) -> k8s_openapi::api::core::v1::Node {
        k8s_openapi::api::core::v1::Node {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn opts() -> TerminationOptions {
        TerminationOptions {
            concurrency: 2,
            retry_interval: Duration::from_millis(10),
            max_attempts: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drain_evicts_workload_pods_only() {
        let fake = FakeStore::new();
        fake.add_node(node("node-1"));
        fake.add_pod(pod_on("node-1", "pod-a"));
        fake.add_pod(pod_on("node-1", "pod-b"));

        let mut ds_pod = pod_on("node-1", "ds-a");
        ds_pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DaemonSet".to_string(),
            ..Default::default()
        }]);
        fake.add_pod(ds_pod);

        let store = Store::Fake(fake.clone());
        drain_node(&store, &EventSink::new(), "node-1", &opts())
            .await
            .unwrap();

        let evicted: Vec<String> = fake.evicted_pods().iter().map(|p| p.name.clone()).collect();
        assert_eq!(evicted.len(), 2);
        assert!(!evicted.contains(&"ds-a".to_string()));
        // Cordoned before evicting.
        assert_eq!(
            fake.node("node-1").unwrap().spec.unwrap().unschedulable,
            Some(true)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pdb_block_retries_then_succeeds() {
        let fake = FakeStore::new();
        fake.add_node(node("node-1"));
        fake.add_pod(pod_on("node-1", "pod-a"));
        fake.block_eviction("default", "pod-a", 2);

        let store = Store::Fake(fake.clone());
        drain_node(&store, &EventSink::new(), "node-1", &opts())
            .await
            .unwrap();
        assert_eq!(fake.evicted_pods().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn do_not_disrupt_pod_blocks_drain() {
        let fake = FakeStore::new();
        fake.add_node(node("node-1"));
        let mut protected = pod_on("node-1", "pod-a");
        protected.metadata.annotations = Some(BTreeMap::from([(
            apis::ANNOTATION_DO_NOT_DISRUPT.to_string(),
            "true".to_string(),
        )]));
        fake.add_pod(protected);

        let store = Store::Fake(fake.clone());
        let err = drain_node(&store, &EventSink::new(), "node-1", &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, DrainError::Blocked(_)));
        assert!(fake.evicted_pods().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn termination_lifts_finalizer_after_drain() {
        use crate::providers::fake::FakeCloudProvider;

        let fake = FakeStore::new();
        let mut guarded = node("node-1");
        guarded.metadata.finalizers = Some(vec![apis::FINALIZER_TERMINATION.to_string()]);
        fake.add_node(guarded);
        fake.add_pod(pod_on("node-1", "pod-a"));
        let store = Store::Fake(fake.clone());

        // A bare delete is held open by the finalizer.
        store.delete_node("node-1").await.unwrap();
        assert!(fake.node("node-1").is_some());
        assert!(fake.deleted_nodes().is_empty());

        terminate_node(
            &store,
            &CloudProvider::Fake(FakeCloudProvider::new()),
            &EventSink::new(),
            &NodeClaim::new("claim-a", Default::default()),
            "node-1",
            &opts(),
        )
        .await
        .unwrap();

        // Drained first, then the finalizer lifted and the node released.
        assert_eq!(fake.evicted_pods().len(), 1);
        assert!(fake.node("node-1").is_none());
        assert_eq!(fake.deleted_nodes(), vec!["node-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_pdb_block_is_reported() {
        let fake = FakeStore::new();
        fake.add_node(node("node-1"));
        fake.add_pod(pod_on("node-1", "pod-a"));
        fake.block_eviction("default", "pod-a", 100);

        let store = Store::Fake(fake.clone());
        let err = drain_node(&store, &EventSink::new(), "node-1", &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, DrainError::PdbViolation(_)));
    }
}
