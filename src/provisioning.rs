//! The provisioning loop: batch pending pods, solve, and launch NodeClaims
//! for the proposed nodes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::apis;
use crate::apis::nodepool::NodePool;
use crate::events::{EventSink, Severity};
use crate::providers::provider::{CloudProvider, InstanceType, ProviderError};
use crate::requirements::Requirements;
use crate::resources::{PodId, ResourceSet, pod_is_terminal};
use crate::scheduling::scheduler::{Scheduler, SchedulingResults};
use crate::scheduling::volume;
use crate::state::Cluster;
use crate::state::statenode::StateNode;
use crate::store::Store;

/// Accumulates pod-event triggers into batches: the loop wakes on the first
/// trigger, then drains until the stream has been idle for `idle` or the
/// batch has been open for `max`.
#[derive(Default)]
pub struct Batcher {
    notify: Notify,
}

impl Batcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self, idle: Duration, max: Duration) {
        self.notify.notified().await;
        let deadline = tokio::time::Instant::now() + max;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            let window = idle.min(remaining);
            if tokio::time::timeout(window, self.notify.notified())
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

/// Everything the solver needs, gathered from the store and the mirror.
/// Disruption simulation reuses the same inputs.
pub struct SchedulerInputs {
    pub snapshot: Vec<(String, StateNode)>,
    pub pools: Vec<NodePool>,
    pub instance_types: BTreeMap<String, Vec<InstanceType>>,
    pub daemon_overhead: BTreeMap<String, ResourceSet>,
    pub pool_usage: BTreeMap<String, ResourceSet>,
    pub bound_pods: Vec<(Pod, BTreeMap<String, String>)>,
    pub anti_affinity_pods: Vec<Pod>,
}

/// Labels a node from this pool is guaranteed to carry before instance
/// selection: template labels plus single-valued template requirements.
pub fn pool_template_labels(pool: &NodePool) -> BTreeMap<String, String> {
    let template = &pool.spec.template;
    let mut labels = template.metadata.labels.clone().unwrap_or_default();
    for spec in &template.spec.requirements {
        if spec.operator == "In"
            && let Some(values) = &spec.values
            && values.len() == 1
        {
            labels.insert(spec.key.clone(), values[0].clone());
        }
    }
    labels.insert(
        apis::LABEL_NODEPOOL.to_string(),
        pool.metadata.name.clone().unwrap_or_default(),
    );
    labels
}

pub async fn gather_inputs(
    store: &Store,
    provider: &CloudProvider,
    cluster: &Cluster,
) -> Result<SchedulerInputs> {
    let mut pools = Vec::new();
    for pool in store.list_node_pools().await? {
        match pool.validate() {
            Ok(()) => pools.push(pool),
            Err(err) => {
                warn!(pool = pool.metadata.name.as_deref().unwrap_or(""), %err, "skipping invalid pool");
            }
        }
    }

    let mut instance_types = BTreeMap::new();
    let mut daemon_overhead = BTreeMap::new();
    for pool in &pools {
        let name = pool.metadata.name.clone().unwrap_or_default();
        let catalog = provider.instance_types(pool).await?;
        instance_types.insert(name.clone(), catalog);
        daemon_overhead.insert(name.clone(), cluster.daemonset_overhead(&pool_template_labels(pool)));
    }

    let snapshot = cluster.nodes_with_keys();
    let mut pool_usage: BTreeMap<String, ResourceSet> = BTreeMap::new();
    let mut labels_by_node: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (_, state) in &snapshot {
        if let Some(pool) = state.pool_name() {
            pool_usage.entry(pool).or_default().add(&state.capacity());
        }
        if let Some(name) = state.node_name() {
            labels_by_node.insert(name, state.labels());
        }
    }

    let mut bound_pods = Vec::new();
    for pod in store.list_pods().await? {
        if pod_is_terminal(&pod) {
            continue;
        }
        let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
            continue;
        };
        let labels = labels_by_node.get(&node_name).cloned().unwrap_or_default();
        bound_pods.push((pod, labels));
    }

    Ok(SchedulerInputs {
        snapshot,
        pools,
        instance_types,
        daemon_overhead,
        pool_usage,
        bound_pods,
        anti_affinity_pods: cluster.anti_affinity_pods(),
    })
}

pub struct ProvisionOutcome {
    pub created_claims: Vec<String>,
    pub nominated: usize,
    pub failed: usize,
}

pub struct Provisioner {
    store: Arc<Store>,
    provider: Arc<CloudProvider>,
    cluster: Arc<Cluster>,
    events: Arc<EventSink>,
}

impl Provisioner {
    pub fn new(
        store: Arc<Store>,
        provider: Arc<CloudProvider>,
        cluster: Arc<Cluster>,
        events: Arc<EventSink>,
    ) -> Self {
        Self {
            store,
            provider,
            cluster,
            events,
        }
    }

    /// One provisioning pass: drain the pending set, solve, launch.
    pub async fn provision_once(&self) -> Result<ProvisionOutcome> {
        let mut batch = self.store.list_pending_pods().await?;

        // Pods on nodes being deleted must be rescheduled too.
        for (_, state) in self
            .cluster
            .nodes_with_keys()
            .iter()
            .filter(|(_, s)| s.marked_for_deletion)
        {
            let node_name = state.node_name().unwrap_or_default();
            for pod in self.store.list_pods_on_node(&node_name).await? {
                if !pod_is_terminal(&pod) && !crate::resources::pod_is_daemonset(&pod) {
                    batch.push(pod);
                }
            }
        }

        if batch.is_empty() {
            return Ok(ProvisionOutcome {
                created_claims: vec![],
                nominated: 0,
                failed: 0,
            });
        }
        info!(count = batch.len(), "found pods needing capacity");

        let inputs = gather_inputs(&self.store, &self.provider, &self.cluster).await?;

        // Volume topology resolves before the solver runs; unsatisfiable
        // pods drop out of the batch with an event.
        let mut volume_requirements: BTreeMap<PodId, Requirements> = BTreeMap::new();
        let mut schedulable = Vec::new();
        for pod in batch {
            let id = PodId::from_pod(&pod);
            match volume::volume_requirements(&self.store, &pod).await {
                Ok(reqs) => {
                    volume_requirements.insert(id, reqs);
                    schedulable.push(pod);
                }
                Err(err) => {
                    self.events.emit(
                        Severity::Warning,
                        "FailedScheduling",
                        &id.to_string(),
                        &err.to_string(),
                    );
                }
            }
        }

        let scheduler = Scheduler::new(
            inputs
                .snapshot
                .iter()
                .filter(|(_, s)| !s.marked_for_deletion)
                .cloned()
                .collect(),
            inputs.pools.clone(),
            inputs.instance_types,
            inputs.daemon_overhead,
            inputs.pool_usage,
            volume_requirements,
            &inputs.bound_pods,
            schedulable,
            &inputs.anti_affinity_pods,
        );
        let results = scheduler.solve();
        self.apply(results, &inputs.pools).await
    }

    async fn apply(
        &self,
        results: SchedulingResults,
        pools: &[NodePool],
    ) -> Result<ProvisionOutcome> {
        let now = Utc::now();
        let mut created_claims = Vec::new();

        for proposal in &results.new_nodes {
            let Some(pool) = pools
                .iter()
                .find(|p| p.metadata.name.as_deref() == Some(proposal.pool_name.as_str()))
            else {
                continue;
            };

            // Re-fetch the pool and verify limits against its latest
            // status before committing.
            if let Ok(latest) = self.store.get_node_pool(&proposal.pool_name).await
                && let Some(limits) = &latest.spec.limits
                && let Ok(limits) = ResourceSet::from_list(limits)
            {
                let mut projected = latest
                    .status
                    .as_ref()
                    .and_then(|s| s.resources.as_ref())
                    .and_then(|r| ResourceSet::from_list(r).ok())
                    .unwrap_or_default();
                if let Some(it) = proposal.cheapest_instance() {
                    projected.add(&it.capacity);
                }
                if let Some(resource) = projected.exceeds(&limits) {
                    self.events.emit(
                        Severity::Warning,
                        "NodePoolLimitExceeded",
                        &proposal.pool_name,
                        &format!("provisioning would exceed {resource} limit"),
                    );
                    continue;
                }
            }

            let mut claim = proposal.to_node_claim(pool);
            crate::apis::nodeclaim::finalize_name(&mut claim);
            let name = claim.metadata.name.clone().unwrap_or_default();
            self.store.create_node_claim(&claim).await?;
            match self.provider.create(&claim).await {
                Ok(realized) => {
                    self.store.update_node_claim(&realized).await?;
                    self.cluster.update_node_claim(&realized);
                    info!(
                        claim = %name,
                        pool = %proposal.pool_name,
                        pods = proposal.pods.len(),
                        instance_type = realized
                            .labels()
                            .get(apis::LABEL_INSTANCE_TYPE)
                            .map(String::as_str)
                            .unwrap_or(""),
                        "launched node claim"
                    );
                    created_claims.push(name);
                }
                Err(ProviderError::InsufficientCapacity(msg)) => {
                    warn!(claim = %name, %msg, "insufficient capacity; abandoning claim");
                    let _ = self.store.delete_node_claim(&name).await;
                    self.events
                        .emit(Severity::Warning, "InsufficientCapacity", &name, &msg);
                }
                Err(err) => {
                    let _ = self.store.delete_node_claim(&name).await;
                    return Err(err.into());
                }
            }
        }

        for assignment in &results.existing_assignments {
            self.cluster
                .nominate(assignment.pod.clone(), &assignment.state_key, now);
            self.events.emit(
                Severity::Normal,
                "Nominated",
                &assignment.pod.to_string(),
                &format!("pod should schedule to {}", assignment.node_name),
            );
        }

        for (pod, err) in &results.errors {
            self.events.emit(
                Severity::Warning,
                "FailedScheduling",
                &pod.to_string(),
                &err.to_string(),
            );
        }

        Ok(ProvisionOutcome {
            created_claims,
            nominated: results.existing_assignments.len(),
            failed: results.errors.len(),
        })
    }

    /// Long-lived singleton: wake on batches (or the fallback tick) until
    /// shutdown flips.
    pub async fn run(
        &self,
        batcher: Arc<Batcher>,
        idle: Duration,
        max: Duration,
        tick: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = batcher.wait(idle, max) => {}
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => {
                    debug!("provisioner interrupted");
                    return;
                }
            }
            if let Err(err) = self.provision_once().await {
                warn!(error = %err, "provisioning pass failed; will retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fake::FakeCloudProvider;
    use crate::providers::kwok;
    use crate::store::FakeStore;
    use k8s_openapi::api::core::v1::{
        Container, PodCondition, PodSpec, PodStatus, ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn pending_pod(name: &str, cpu: &str) -> Pod {
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "worker".to_string(),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "cpu".to_string(),
                            Quantity(cpu.to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    reason: Some("Unschedulable".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn provisioner(fake_store: FakeStore, fake_provider: FakeCloudProvider) -> Provisioner {
        Provisioner::new(
            Arc::new(Store::Fake(fake_store)),
            Arc::new(CloudProvider::Fake(fake_provider)),
            Arc::new(Cluster::new()),
            Arc::new(EventSink::new()),
        )
    }

    #[tokio::test]
    async fn three_pods_one_claim() {
        let store = FakeStore::new();
        store.add_node_pool(NodePool::new("default", Default::default()));
        for i in 0..3 {
            store.add_pod(pending_pod(&format!("pod-{i}"), "500m"));
        }
        let provider = FakeCloudProvider::new()
            .with_instance_types(vec![kwok::instance_type("small", 2, 4_096, 0.01)]);

        let outcome = provisioner(store.clone(), provider)
            .provision_once()
            .await
            .unwrap();
        assert_eq!(outcome.created_claims.len(), 1);
        assert_eq!(outcome.failed, 0);

        let claim = Store::Fake(store)
            .get_node_claim(&outcome.created_claims[0])
            .await
            .unwrap();
        assert!(claim.provider_id().is_some());
        let labels = claim.labels();
        assert_eq!(
            labels.get(apis::LABEL_NODEPOOL).map(String::as_str),
            Some("default")
        );
        assert!(labels.contains_key(apis::LABEL_ZONE));
        assert!(labels.contains_key(apis::LABEL_CAPACITY_TYPE));
        assert!(labels.contains_key(apis::LABEL_HOSTNAME));
        assert_eq!(
            labels.get(apis::LABEL_INSTANCE_TYPE).map(String::as_str),
            Some("small")
        );
    }

    #[tokio::test]
    async fn no_pending_pods_is_a_noop() {
        let store = FakeStore::new();
        store.add_node_pool(NodePool::new("default", Default::default()));
        let provider = FakeCloudProvider::new()
            .with_instance_types(vec![kwok::instance_type("small", 2, 4_096, 0.01)]);
        let outcome = provisioner(store, provider).provision_once().await.unwrap();
        assert!(outcome.created_claims.is_empty());
    }

    #[tokio::test]
    async fn unschedulable_pod_surfaces_error() {
        let store = FakeStore::new();
        store.add_node_pool(NodePool::new("default", Default::default()));
        store.add_pod(pending_pod("pod-huge", "64"));
        let provider = FakeCloudProvider::new()
            .with_instance_types(vec![kwok::instance_type("small", 2, 4_096, 0.01)]);

        let outcome = provisioner(store, provider).provision_once().await.unwrap();
        assert!(outcome.created_claims.is_empty());
        assert_eq!(outcome.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batcher_drains_until_idle() {
        let batcher = Arc::new(Batcher::new());
        let waiter = batcher.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait(Duration::from_secs(1), Duration::from_secs(10))
                .await;
            tokio::time::Instant::now()
        });

        batcher.trigger();
        tokio::time::sleep(Duration::from_millis(500)).await;
        batcher.trigger();
        // No further triggers: the batch closes one idle period later.
        let finished = handle.await.unwrap();
        assert!(finished.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn batcher_respects_max_window() {
        let batcher = Arc::new(Batcher::new());
        let waiter = batcher.clone();
        let start = tokio::time::Instant::now();
        let handle = tokio::spawn(async move {
            waiter
                .wait(Duration::from_secs(1), Duration::from_secs(3))
                .await;
        });

        // Keep triggering more often than the idle window forever; the max
        // window must still close the batch.
        batcher.trigger();
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            batcher.trigger();
        }
        handle.await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(7));
    }
}
