//! Proposed nodes: capacity the scheduler intends to create.
//!
//! A proposal starts as the pool template's full flexibility and tightens
//! by intersection as pods are added: fewer allowed domains, fewer
//! instance-type options, more reserved resources. An addition that would
//! leave no instance type, or violate a requirement's minValues, is
//! rejected without mutating the proposal.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Pod, Taint};

use super::topology::Topology;
use super::{SchedulingError, tolerates_taints};
use crate::apis;
use crate::apis::nodeclaim::{NodeClaim, NodeClaimSpec, RequirementSpec, ResourceRequestsSpec};
use crate::apis::nodepool::NodePool;
use crate::providers::provider::InstanceType;
use crate::requirements::{Requirement, Requirements};
use crate::resources::{PodId, ResourceSet};

#[derive(Clone)]
pub struct NodeProposal {
    pub pool_name: String,
    pub hostname: String,
    pub requirements: Requirements,
    /// Remaining options, cheapest first under the current requirements.
    pub instance_types: Vec<InstanceType>,
    pub taints: Vec<Taint>,
    pub pods: Vec<PodId>,
    pub pod_requests: ResourceSet,
    pub daemon_overhead: ResourceSet,
}

/// The surviving option set must keep at least `minValues` distinct
/// instance types when the requirement asks for flexibility.
fn min_instance_types_satisfied(requirements: &Requirements, options: &[InstanceType]) -> bool {
    requirements
        .get(apis::LABEL_INSTANCE_TYPE)
        .and_then(|r| r.min_values)
        .map(|min| options.len() >= min as usize)
        .unwrap_or(true)
}

fn sort_by_price(instance_types: &mut [InstanceType], requirements: &Requirements) {
    instance_types.sort_by(|a, b| {
        let pa = a.cheapest_price(requirements).unwrap_or(f64::MAX);
        let pb = b.cheapest_price(requirements).unwrap_or(f64::MAX);
        pa.total_cmp(&pb).then_with(|| a.name.cmp(&b.name))
    });
}

impl NodeProposal {
    pub fn from_pool(
        pool: &NodePool,
        instance_types: &[InstanceType],
        daemon_overhead: ResourceSet,
        hostname: String,
    ) -> Result<Self, SchedulingError> {
        let pool_name = pool.metadata.name.clone().unwrap_or_default();
        let template = &pool.spec.template;

        let mut requirements = Requirements::new();
        for (key, value) in template.metadata.labels.iter().flatten() {
            requirements.add(Requirement::in_values(key, [value.clone()]))?;
        }
        for spec in &template.spec.requirements {
            requirements.add(spec.to_requirement().map_err(SchedulingError::from)?)?;
        }
        requirements.add(Requirement::in_values(
            apis::LABEL_NODEPOOL,
            [pool_name.clone()],
        ))?;
        requirements.add(Requirement::in_values(
            apis::LABEL_HOSTNAME,
            [hostname.clone()],
        ))?;

        let mut options: Vec<InstanceType> = instance_types
            .iter()
            .filter(|it| {
                requirements.compatible_with_option(&it.full_requirements())
                    && it.has_available_offering(&requirements)
            })
            .cloned()
            .collect();
        if options.is_empty() {
            return Err(SchedulingError::NoInstanceTypeFits);
        }
        if !min_instance_types_satisfied(&requirements, &options) {
            return Err(SchedulingError::NoInstanceTypeFits);
        }
        sort_by_price(&mut options, &requirements);

        Ok(Self {
            pool_name,
            hostname,
            requirements,
            instance_types: options,
            taints: template.spec.taints.clone(),
            pods: Vec::new(),
            pod_requests: ResourceSet::new(),
            daemon_overhead,
        })
    }

    /// Try to add the pod, tightening requirements and instance options.
    /// All-or-nothing: the proposal is unchanged on error.
    pub fn try_add(
        &mut self,
        topology: &mut Topology,
        pod: &Pod,
        pod_requirements: &Requirements,
        requests: &ResourceSet,
        ignore_prefer_no_schedule: bool,
    ) -> Result<(), SchedulingError> {
        tolerates_taints(pod, &self.taints, ignore_prefer_no_schedule)?;

        // minValues violations surface here as MinValues errors.
        let mut merged = self.requirements.intersect(pod_requirements)?;

        let constraints = topology.constraints_for(pod)?;
        let mut constrained_keys = BTreeSet::new();
        for constraint in &constraints {
            constrained_keys.insert(constraint.key().to_string());
            merged.add(constraint.clone())?;
        }
        // Topology counting needs a concrete domain per constrained key;
        // pin to the least-loaded allowed domain.
        for key in &constrained_keys {
            if let Some(requirement) = merged.get(key)
                && requirement.len() != 1
                && let Some(domain) = topology.pin_domain(key, requirement)
            {
                merged.add(Requirement::in_values(key, [domain]))?;
            }
        }

        let mut total = self.pod_requests.clone();
        total.add(requests);
        total.add(&self.daemon_overhead);

        let mut remaining: Vec<InstanceType> = self
            .instance_types
            .iter()
            .filter(|it| {
                merged.compatible_with_option(&it.full_requirements())
                    && it.has_available_offering(&merged)
                    && total.fits(&it.allocatable())
            })
            .cloned()
            .collect();
        if remaining.is_empty() {
            return Err(SchedulingError::NoInstanceTypeFits);
        }
        // Tightening must not shrink the option set below a requirement's
        // minValues.
        if !min_instance_types_satisfied(&merged, &remaining) {
            return Err(SchedulingError::Requirements(
                crate::requirements::RequirementsError::MinValues {
                    key: apis::LABEL_INSTANCE_TYPE.to_string(),
                    required: merged
                        .get(apis::LABEL_INSTANCE_TYPE)
                        .and_then(|r| r.min_values)
                        .unwrap_or(0),
                },
            ));
        }
        sort_by_price(&mut remaining, &merged);

        self.requirements = merged;
        self.instance_types = remaining;
        self.pods.push(PodId::from_pod(pod));
        self.pod_requests.add(requests);
        topology.record(pod, &self.resolved_labels());
        Ok(())
    }

    /// Labels the realized node is guaranteed to carry.
    pub fn resolved_labels(&self) -> BTreeMap<String, String> {
        self.requirements.resolved_labels()
    }

    pub fn cheapest_instance(&self) -> Option<&InstanceType> {
        self.instance_types.first()
    }

    pub fn price(&self) -> Option<f64> {
        self.cheapest_instance()
            .and_then(|it| it.cheapest_price(&self.requirements))
    }

    /// Materialize as a NodeClaim owned by the pool.
    pub fn to_node_claim(&self, pool: &NodePool) -> NodeClaim {
        let template = &pool.spec.template;
        let mut requests = self.pod_requests.clone();
        requests.add(&self.daemon_overhead);

        // The batch-internal hostname is replaced with a unique name at
        // claim-creation time, so it is not a real requirement.
        let mut requirement_specs: Vec<RequirementSpec> = self
            .requirements
            .iter()
            .filter(|r| r.key() != apis::LABEL_HOSTNAME)
            .map(RequirementSpec::from_requirement)
            .collect();
        // The surviving instance-type options become a claim requirement so
        // the provider picks within what the solver validated.
        if !self.instance_types.is_empty()
            && !requirement_specs
                .iter()
                .any(|r| r.key == apis::LABEL_INSTANCE_TYPE)
        {
            requirement_specs.push(RequirementSpec {
                key: apis::LABEL_INSTANCE_TYPE.to_string(),
                operator: "In".to_string(),
                values: Some(self.instance_types.iter().map(|it| it.name.clone()).collect()),
                min_values: None,
            });
        }

        let mut claim = NodeClaim::new(
            &self.hostname,
            NodeClaimSpec {
                requirements: requirement_specs,
                resources: ResourceRequestsSpec {
                    requests: Some(requests.to_list()),
                },
                taints: template.spec.taints.clone(),
                startup_taints: template.spec.startup_taints.clone(),
                node_class_ref: template.spec.node_class_ref.clone(),
            },
        );
        let mut labels = template.metadata.labels.clone().unwrap_or_default();
        labels.extend(self.resolved_labels());
        labels.insert(apis::LABEL_NODEPOOL.to_string(), self.pool_name.clone());
        claim.metadata.labels = Some(labels);
        claim.metadata.annotations = template.metadata.annotations.clone();
        claim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::nodepool::NodePoolSpec;
    use crate::providers::kwok;
    use k8s_openapi::api::core::v1::PodSpec;

    fn pool(name: &str) -> NodePool {
        NodePool::new(name, NodePoolSpec::default())
    }

    fn catalog() -> Vec<InstanceType> {
        vec![
            kwok::instance_type("small", 2, 4_096, 0.01),
            kwok::instance_type("large", 8, 16_384, 0.04),
        ]
    }

    fn topo() -> Topology {
        Topology::new(BTreeMap::from([(
            apis::LABEL_ZONE.to_string(),
            BTreeSet::from([
                "zone-a".to_string(),
                "zone-b".to_string(),
                "zone-c".to_string(),
            ]),
        )]))
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

    fn cpu(m: i64) -> ResourceSet {
        ResourceSet::new().with("cpu", m).with("pods", 1000)
    }

    #[test]
    fn options_sorted_cheapest_first() {
        let proposal =
            NodeProposal::from_pool(&pool("default"), &catalog(), ResourceSet::new(), "n-1".into())
                .unwrap();
        assert_eq!(proposal.instance_types[0].name, "small");
        assert_eq!(proposal.instance_types[1].name, "large");
    }

    #[test]
    fn adding_pods_prunes_small_instances() {
        let mut proposal =
            NodeProposal::from_pool(&pool("default"), &catalog(), ResourceSet::new(), "n-1".into())
                .unwrap();
        let mut topology = topo();

        proposal
            .try_add(&mut topology, &pod("pod-a"), &Requirements::new(), &cpu(1500), false)
            .unwrap();
        assert_eq!(proposal.instance_types.len(), 2);

        // 1.5 + 1.5 cpu exceeds the small type's allocatable (2 cpu − reserved).
        proposal
            .try_add(&mut topology, &pod("pod-b"), &Requirements::new(), &cpu(1500), false)
            .unwrap();
        assert_eq!(proposal.instance_types.len(), 1);
        assert_eq!(proposal.instance_types[0].name, "large");
        assert_eq!(proposal.pods.len(), 2);
    }

    #[test]
    fn rejecting_pod_leaves_proposal_unchanged() {
        let mut proposal =
            NodeProposal::from_pool(&pool("default"), &catalog(), ResourceSet::new(), "n-1".into())
                .unwrap();
        let mut topology = topo();
        proposal
            .try_add(&mut topology, &pod("pod-a"), &Requirements::new(), &cpu(1000), false)
            .unwrap();
        let options_before = proposal.instance_types.len();

        let err = proposal
            .try_add(
                &mut topology,
                &pod("pod-huge"),
                &Requirements::new(),
                &cpu(64_000),
                false,
            )
            .unwrap_err();
        assert_eq!(err, SchedulingError::NoInstanceTypeFits);
        assert_eq!(proposal.pods.len(), 1);
        assert_eq!(proposal.instance_types.len(), options_before);
    }

    #[test]
    fn zone_requirement_narrows_and_resolves_labels() {
        let mut proposal =
            NodeProposal::from_pool(&pool("default"), &catalog(), ResourceSet::new(), "n-1".into())
                .unwrap();
        let mut topology = topo();
        let reqs = Requirements::from_requirements([Requirement::in_values(
            apis::LABEL_ZONE,
            ["zone-b"],
        )])
        .unwrap();
        proposal
            .try_add(&mut topology, &pod("pod-a"), &reqs, &cpu(500), false)
            .unwrap();

        let labels = proposal.resolved_labels();
        assert_eq!(labels.get(apis::LABEL_ZONE).map(String::as_str), Some("zone-b"));
        assert_eq!(labels.get(apis::LABEL_NODEPOOL).map(String::as_str), Some("default"));
        assert_eq!(labels.get(apis::LABEL_HOSTNAME).map(String::as_str), Some("n-1"));
    }

    #[test]
    fn min_values_narrowing_is_rejected() {
        let mut pool = pool("default");
        pool.spec.template.spec.requirements = vec![RequirementSpec {
            key: apis::LABEL_INSTANCE_TYPE.to_string(),
            operator: "In".to_string(),
            values: Some(vec!["small".to_string(), "large".to_string()]),
            min_values: Some(2),
        }];
        let mut proposal =
            NodeProposal::from_pool(&pool, &catalog(), ResourceSet::new(), "n-1".into()).unwrap();
        let mut topology = topo();

        let pin = Requirements::from_requirements([Requirement::in_values(
            apis::LABEL_INSTANCE_TYPE,
            ["small"],
        )])
        .unwrap();
        let err = proposal
            .try_add(&mut topology, &pod("pod-a"), &pin, &cpu(100), false)
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulingError::Requirements(crate::requirements::RequirementsError::MinValues { .. })
        ));
        assert!(proposal.pods.is_empty());
    }

    #[test]
    fn node_claim_carries_tightened_requirements() {
        let mut proposal =
            NodeProposal::from_pool(&pool("default"), &catalog(), ResourceSet::new(), "n-1".into())
                .unwrap();
        let mut topology = topo();
        let reqs = Requirements::from_requirements([Requirement::in_values(
            apis::LABEL_ZONE,
            ["zone-a"],
        )])
        .unwrap();
        proposal
            .try_add(&mut topology, &pod("pod-a"), &reqs, &cpu(500), false)
            .unwrap();

        let claim = proposal.to_node_claim(&pool("default"));
        assert_eq!(claim.metadata.name.as_deref(), Some("n-1"));
        let zone_req = claim
            .spec
            .requirements
            .iter()
            .find(|r| r.key == apis::LABEL_ZONE)
            .unwrap();
        assert_eq!(zone_req.values.as_deref(), Some(&["zone-a".to_string()][..]));
        assert!(
            claim
                .labels()
                .contains_key(apis::LABEL_NODEPOOL)
        );
        let requests = claim.spec.resources.requests.unwrap();
        assert!(requests.contains_key("cpu"));
    }
}
