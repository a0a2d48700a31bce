//! Placement attempts against nodes that already exist in the cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;

use super::topology::Topology;
use super::{SchedulingError, tolerates_taints};
use crate::requirements::Requirements;
use crate::resources::{PodId, ResourceSet};
use crate::state::statenode::StateNode;

/// A live StateNode plus the in-flight placements this scheduling run has
/// already committed to it.
pub struct ExistingNode {
    pub state: StateNode,
    pub name: String,
    pub state_key: String,
    labels: BTreeMap<String, String>,
    available: ResourceSet,
    pub assigned: Vec<PodId>,
}

impl ExistingNode {
    pub fn new(state: StateNode, state_key: String) -> Self {
        let labels = state.labels();
        let available = state.available();
        let name = state.name();
        Self {
            state,
            name,
            state_key,
            labels,
            available,
            assigned: Vec::new(),
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Try to place the pod here; commits resource and topology accounting
    /// on success, touches nothing on failure.
    pub fn try_add(
        &mut self,
        topology: &mut Topology,
        pod: &Pod,
        pod_requirements: &Requirements,
        requests: &ResourceSet,
        ignore_prefer_no_schedule: bool,
    ) -> Result<(), SchedulingError> {
        if !self.state.initialized() {
            return Err(SchedulingError::UninitializedNode);
        }
        tolerates_taints(pod, &self.state.taints(), ignore_prefer_no_schedule)?;
        if !pod_requirements.satisfied_by_labels(&self.labels) {
            return Err(SchedulingError::Requirements(
                crate::requirements::RequirementsError::Incompatible {
                    key: "node labels".to_string(),
                },
            ));
        }
        for constraint in topology.constraints_for(pod)? {
            let satisfied = match self.labels.get(constraint.key()) {
                Some(value) => constraint.has(value),
                None => false,
            };
            if !satisfied {
                return Err(SchedulingError::Topology(constraint.key().to_string()));
            }
        }
        if !requests.fits(&self.available) {
            return Err(SchedulingError::InsufficientResources(self.name.clone()));
        }

        self.available = self.available.saturating_sub(requests);
        self.assigned.push(PodId::from_pod(pod));
        topology.record(pod, &self.labels);
        Ok(())
    }
}
