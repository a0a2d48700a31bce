#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Container, Node, NodeCondition, NodeSpec, NodeStatus, Pod, PodCondition, PodSpec, PodStatus,
    ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use canopy::apis;
use canopy::apis::nodeclaim::{NodeClaim, RequirementSpec, chrono_to_jiff, condition};
use canopy::apis::nodepool::{NodePool, NodePoolSpec};
use canopy::events::EventSink;
use canopy::providers::fake::FakeCloudProvider;
use canopy::providers::kwok;
use canopy::providers::provider::{CloudProvider, InstanceType};
use canopy::state::Cluster;
use canopy::store::{FakeStore, Store};

pub fn pending_pod(name: &str, cpu: &str, memory: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "worker".into(),
                image: Some("busybox".into()),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([
                        ("cpu".into(), Quantity(cpu.into())),
                        ("memory".into(), Quantity(memory.into())),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Pending".into()),
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".into(),
                status: "False".into(),
                reason: Some("Unschedulable".into()),
                message: Some("insufficient resources".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn bound_pod(name: &str, node: &str, cpu: &str) -> Pod {
    let mut pod = pending_pod(name, cpu, "128Mi");
    pod.spec.as_mut().unwrap().node_name = Some(node.into());
    pod.status = Some(PodStatus {
        phase: Some("Running".into()),
        ..Default::default()
    });
    pod
}

pub fn node_labels(instance_type: &str, pool: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (apis::LABEL_ZONE.to_string(), "zone-a".to_string()),
        (
            apis::LABEL_CAPACITY_TYPE.to_string(),
            apis::CAPACITY_TYPE_ON_DEMAND.to_string(),
        ),
        (
            apis::LABEL_INSTANCE_TYPE.to_string(),
            instance_type.to_string(),
        ),
        (apis::LABEL_NODEPOOL.to_string(), pool.to_string()),
    ])
}

pub fn ready_node(name: &str, provider_id: &str, cpu: &str, labels: BTreeMap<String, String>) -> Node {
    let resources = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity("16Gi".to_string())),
        ("pods".to_string(), Quantity("110".to_string())),
    ]);
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(provider_id.to_string()),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            capacity: Some(resources.clone()),
            allocatable: Some(resources),
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn initialized_claim(
    name: &str,
    provider_id: &str,
    cpu: &str,
    labels: BTreeMap<String, String>,
) -> NodeClaim {
    let now = Utc::now();
    let mut claim = NodeClaim::new(name, Default::default());
    claim.metadata.labels = Some(labels);
    claim.metadata.creation_timestamp = Some(
        k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono_to_jiff(now - chrono::Duration::hours(1))),
    );
    claim.set_condition(condition::INITIALIZED, true, "Initialized", "", now);
    let resources = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity("16Gi".to_string())),
        ("pods".to_string(), Quantity("110".to_string())),
    ]);
    let st = claim.status.as_mut().unwrap();
    st.provider_id = Some(provider_id.to_string());
    st.capacity = Some(resources.clone());
    st.allocatable = Some(resources);
    claim
}

/// A pool whose nodes are pinned to on-demand capacity.
pub fn on_demand_pool(name: &str) -> NodePool {
    let mut pool = NodePool::new(name, NodePoolSpec::default());
    pool.spec.template.spec.requirements = vec![RequirementSpec {
        key: apis::LABEL_CAPACITY_TYPE.to_string(),
        operator: "In".to_string(),
        values: Some(vec![apis::CAPACITY_TYPE_ON_DEMAND.to_string()]),
        min_values: None,
    }];
    pool
}

pub fn small_catalog() -> Vec<InstanceType> {
    vec![
        kwok::instance_type("c-2x", 2, 4_096, 0.02),
        kwok::instance_type("c-4x", 4, 8_192, 0.04),
    ]
}

/// A cluster seeded into both the fake store and the mirror: one entry per
/// (node, claim) pair.
pub struct TestCluster {
    pub store: FakeStore,
    pub provider: FakeCloudProvider,
    pub cluster: Arc<Cluster>,
    pub events: Arc<EventSink>,
}

impl TestCluster {
    pub fn new(catalog: Vec<InstanceType>) -> Self {
        Self {
            store: FakeStore::new(),
            provider: FakeCloudProvider::new().with_instance_types(catalog),
            cluster: Arc::new(Cluster::new()),
            events: Arc::new(EventSink::new()),
        }
    }

    pub fn store_arc(&self) -> Arc<Store> {
        Arc::new(Store::Fake(self.store.clone()))
    }

    pub fn provider_arc(&self) -> Arc<CloudProvider> {
        Arc::new(CloudProvider::Fake(self.provider.clone()))
    }

    pub fn add_pool(&self, pool: NodePool) {
        self.store.add_node_pool(pool.clone());
        self.cluster.update_node_pool(&pool);
    }

    /// Seed one live node with its claim, mirrored everywhere.
    pub fn add_member(&self, index: u32, instance_type: &str, pool: &str, cpu: &str) -> String {
        let provider_id = format!("fake:///{index}");
        let node_name = format!("node-{index}");
        let claim_name = format!("claim-{index}");
        let labels = node_labels(instance_type, pool);

        let node = ready_node(&node_name, &provider_id, cpu, labels.clone());
        let claim = initialized_claim(&claim_name, &provider_id, cpu, labels);
        self.store.add_node(node.clone());
        self.store.add_node_claim(claim.clone());
        self.cluster.update_node(&node);
        self.cluster.update_node_claim(&claim);
        provider_id
    }

    pub fn bind_pod(&self, pod: Pod) {
        self.store.add_pod(pod.clone());
        self.cluster.update_pod(&pod);
    }

}
