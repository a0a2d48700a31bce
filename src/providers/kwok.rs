//! Kubernetes With Out Kubelet provider: materializes NodeClaims as fake
//! Nodes that a kwok controller animates. Used on development clusters.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, NodeSpec, NodeStatus};
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Api, Client};

use crate::apis;
use crate::apis::nodeclaim::{NodeClaim, NodeClaimSpec, NodeClaimStatus};
use crate::apis::nodepool::NodePool;
use crate::providers::provider::{InstanceType, Offering, Overhead, ProviderError};
use crate::resources::ResourceSet;

const KWOK_PROVIDER_PREFIX: &str = "kwok://";
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Build a catalog entry sold in three zones as on-demand and (discounted)
/// spot.
pub fn instance_type(name: &str, cpu: u32, memory_mib: u64, price: f64) -> InstanceType {
    let mut offerings = Vec::new();
    for zone in ["zone-a", "zone-b", "zone-c"] {
        offerings.push(Offering {
            capacity_type: apis::CAPACITY_TYPE_ON_DEMAND.to_string(),
            zone: zone.to_string(),
            price,
            available: true,
        });
        offerings.push(Offering {
            capacity_type: apis::CAPACITY_TYPE_SPOT.to_string(),
            zone: zone.to_string(),
            price: price * 0.35,
            available: true,
        });
    }
    InstanceType {
        name: name.to_string(),
        requirements: crate::requirements::Requirements::from_labels(&BTreeMap::from([(
            "kubernetes.io/arch".to_string(),
            "amd64".to_string(),
        )])),
        offerings,
        capacity: ResourceSet::new()
            .with("cpu", cpu as i64 * 1000)
            .with("memory", memory_mib as i64 * 1024 * 1024 * 1000)
            .with("pods", 110_000),
        overhead: Overhead {
            kube_reserved: ResourceSet::new()
                .with("cpu", 80)
                .with("memory", 100 * 1024 * 1024 * 1000),
            ..Default::default()
        },
    }
}

fn default_catalog() -> Vec<InstanceType> {
    vec![
        instance_type("c-1x", 1, 2_048, 0.0040),
        instance_type("c-2x", 2, 4_096, 0.0066),
        instance_type("c-4x", 4, 8_192, 0.0106),
        instance_type("c-8x", 8, 16_384, 0.0170),
        instance_type("c-16x", 16, 32_768, 0.0314),
        instance_type("m-2x", 2, 8_192, 0.0386),
        instance_type("m-4x", 4, 16_384, 0.0475),
        instance_type("m-8x", 8, 32_768, 0.0900),
        instance_type("m-16x", 16, 65_536, 0.1789),
    ]
}

/// Resolve a claim against a catalog and fill in its status: pick the
/// cheapest compatible in-stock offering, stamp the reserved labels, and
/// record capacity/allocatable. Returns None when nothing in the catalog
/// satisfies the claim.
pub fn realize_claim(
    claim: &NodeClaim,
    catalog: &[InstanceType],
    provider_id: &str,
) -> Option<NodeClaim> {
    let requirements = claim.requirements().ok()?;
    let requests = claim
        .spec
        .resources
        .requests
        .as_ref()
        .and_then(|r| ResourceSet::from_list(r).ok())
        .unwrap_or_default();

    let mut best: Option<(&InstanceType, &Offering)> = None;
    for it in catalog {
        if !requirements.compatible_with_option(&it.full_requirements()) {
            continue;
        }
        if !requests.fits(&it.allocatable()) {
            continue;
        }
        for offering in &it.offerings {
            if !offering.available || !offering.compatible(&requirements) {
                continue;
            }
            if best
                .map(|(_, current)| offering.price < current.price)
                .unwrap_or(true)
            {
                best = Some((it, offering));
            }
        }
    }
    let (it, offering) = best?;

    let mut realized = claim.clone();
    let name = realized.metadata.name.clone().unwrap_or_default();
    let labels = realized.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(apis::LABEL_INSTANCE_TYPE.to_string(), it.name.clone());
    labels.insert(apis::LABEL_ZONE.to_string(), offering.zone.clone());
    labels.insert(
        apis::LABEL_CAPACITY_TYPE.to_string(),
        offering.capacity_type.clone(),
    );
    labels.insert(apis::LABEL_HOSTNAME.to_string(), name);
    let conditions = realized
        .status
        .take()
        .map(|s| s.conditions)
        .unwrap_or_default();
    realized.status = Some(NodeClaimStatus {
        provider_id: Some(provider_id.to_string()),
        capacity: Some(it.capacity.to_list()),
        allocatable: Some(it.allocatable().to_list()),
        conditions,
    });
    Some(realized)
}

pub struct KwokProvider {
    client: Client,
    catalog: Vec<InstanceType>,
}

impl KwokProvider {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            catalog: default_catalog(),
        }
    }

    fn node_name(provider_id: &str) -> Option<&str> {
        provider_id.strip_prefix(KWOK_PROVIDER_PREFIX)
    }

    pub async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim, ProviderError> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        let provider_id = format!("{KWOK_PROVIDER_PREFIX}{name}");
        let realized = realize_claim(claim, &self.catalog, &provider_id).ok_or_else(|| {
            ProviderError::InsufficientCapacity(format!("no instance type satisfies {name}"))
        })?;

        let status = realized.status.as_ref();
        let mut labels = realized.labels();
        labels.insert(MANAGED_BY_LABEL.to_string(), "canopy".to_string());
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(labels),
                annotations: Some(BTreeMap::from([(
                    "kwok.x-k8s.io/node".to_string(),
                    "fake".to_string(),
                )])),
                // Holds deletion open until termination finishes draining.
                finalizers: Some(vec![apis::FINALIZER_TERMINATION.to_string()]),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some(provider_id),
                taints: if realized.spec.startup_taints.is_empty() {
                    None
                } else {
                    Some(realized.spec.startup_taints.clone())
                },
                ..Default::default()
            }),
            status: Some(NodeStatus {
                capacity: status.and_then(|s| s.capacity.clone()),
                allocatable: status.and_then(|s| s.allocatable.clone()),
                ..Default::default()
            }),
        };
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .create(&PostParams::default(), &node)
            .await
            .map_err(|e| ProviderError::Internal(e.into()))?;
        Ok(realized)
    }

    pub async fn delete(&self, claim: &NodeClaim) -> Result<(), ProviderError> {
        let provider_id = claim
            .provider_id()
            .ok_or_else(|| ProviderError::NotFound("claim has no providerID".to_string()))?;
        let name = Self::node_name(provider_id)
            .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))?;
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(ProviderError::NotFound(provider_id.to_string()))
            }
            Err(e) => Err(ProviderError::Internal(e.into())),
        }
    }

    pub async fn get(&self, provider_id: &str) -> Result<NodeClaim, ProviderError> {
        let name = Self::node_name(provider_id)
            .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))?;
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.get(name).await {
            Ok(node) => Ok(claim_from_node(&node)),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(ProviderError::NotFound(provider_id.to_string()))
            }
            Err(e) => Err(ProviderError::Internal(e.into())),
        }
    }

    pub async fn list(&self) -> Result<Vec<NodeClaim>, ProviderError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&format!("{MANAGED_BY_LABEL}=canopy"));
        let list = nodes
            .list(&lp)
            .await
            .map_err(|e| ProviderError::Internal(e.into()))?;
        Ok(list.iter().map(claim_from_node).collect())
    }

    pub async fn instance_types(
        &self,
        _pool: &NodePool,
    ) -> Result<Vec<InstanceType>, ProviderError> {
        Ok(self.catalog.clone())
    }

    pub async fn is_drifted(&self, _claim: &NodeClaim) -> Result<Option<String>, ProviderError> {
        // kwok nodes have no machine image or template to drift from.
        Ok(None)
    }
}

fn claim_from_node(node: &Node) -> NodeClaim {
    let mut claim = NodeClaim::new(
        node.metadata.name.as_deref().unwrap_or_default(),
        NodeClaimSpec::default(),
    );
    claim.metadata.labels = node.metadata.labels.clone();
    claim.status = Some(NodeClaimStatus {
        provider_id: node.spec.as_ref().and_then(|s| s.provider_id.clone()),
        capacity: node.status.as_ref().and_then(|s| s.capacity.clone()),
        allocatable: node.status.as_ref().and_then(|s| s.allocatable.clone()),
        conditions: vec![],
    });
    claim
}
