//! The batch solver: place every pending pod on existing capacity or the
//! cheapest set of proposed nodes, deterministically.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use super::existing::ExistingNode;
use super::preferences::{self, RelaxablePod};
use super::proposal::NodeProposal;
use super::topology::Topology;
use super::SchedulingError;
use crate::apis;
use crate::apis::nodepool::NodePool;
use crate::providers::provider::InstanceType;
use crate::requirements::{Requirement, Requirements};
use crate::resources::{PodId, ResourceSet, pod_requests};
use crate::state::statenode::StateNode;

/// A pod the solver bound to a live node.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingAssignment {
    pub pod: PodId,
    pub state_key: String,
    pub node_name: String,
}

pub struct SchedulingResults {
    pub new_nodes: Vec<NodeProposal>,
    pub existing_assignments: Vec<ExistingAssignment>,
    pub errors: BTreeMap<PodId, SchedulingError>,
}

impl SchedulingResults {
    pub fn all_scheduled(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct Scheduler {
    pools: Vec<NodePool>,
    instance_types: BTreeMap<String, Vec<InstanceType>>,
    existing: Vec<ExistingNode>,
    proposals: Vec<NodeProposal>,
    topology: Topology,
    daemon_overhead: BTreeMap<String, ResourceSet>,
    /// Remaining room under each pool's limits; None = unlimited.
    pool_remaining: BTreeMap<String, Option<ResourceSet>>,
    excluded_pools: BTreeSet<String>,
    volume_requirements: BTreeMap<PodId, Requirements>,
    batch: Vec<Pod>,
    existing_assignments: Vec<ExistingAssignment>,
    errors: BTreeMap<PodId, SchedulingError>,
    next_node_index: usize,
}

impl Scheduler {
    /// `nodes` is the cluster snapshot minus anything being disrupted;
    /// `bound_pods` carries each placed pod with its node's labels for
    /// topology counting.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nodes: Vec<(String, StateNode)>,
        mut pools: Vec<NodePool>,
        instance_types: BTreeMap<String, Vec<InstanceType>>,
        daemon_overhead: BTreeMap<String, ResourceSet>,
        pool_usage: BTreeMap<String, ResourceSet>,
        volume_requirements: BTreeMap<PodId, Requirements>,
        bound_pods: &[(Pod, BTreeMap<String, String>)],
        batch: Vec<Pod>,
        anti_affinity_pods: &[Pod],
    ) -> Self {
        pools.sort_by_key(|p| p.ordering_key());

        let mut universe: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for its in instance_types.values() {
            for it in its {
                for offering in &it.offerings {
                    universe
                        .entry(apis::LABEL_ZONE.to_string())
                        .or_default()
                        .insert(offering.zone.clone());
                    universe
                        .entry(apis::LABEL_CAPACITY_TYPE.to_string())
                        .or_default()
                        .insert(offering.capacity_type.clone());
                }
            }
        }
        for (_, state) in &nodes {
            for (key, value) in state.labels() {
                universe.entry(key).or_default().insert(value);
            }
        }

        let mut topology = Topology::new(universe);
        for pod in &batch {
            topology.track_pod_constraints(pod);
        }
        for pod in anti_affinity_pods {
            topology.track_pod_constraints(pod);
        }
        for (pod, labels) in bound_pods {
            topology.record(pod, labels);
        }

        let mut existing: Vec<ExistingNode> = nodes
            .into_iter()
            .filter(|(_, state)| !state.marked_for_deletion)
            .map(|(key, state)| ExistingNode::new(state, key))
            .collect();
        existing.sort_by(|a, b| a.name.cmp(&b.name));

        let pool_remaining = pools
            .iter()
            .map(|pool| {
                let name = pool.metadata.name.clone().unwrap_or_default();
                let remaining = pool.spec.limits.as_ref().and_then(|limits| {
                    let limits = ResourceSet::from_list(limits).ok()?;
                    let used = pool_usage.get(&name).cloned().unwrap_or_default();
                    Some(limits.saturating_sub(&used))
                });
                (name, remaining)
            })
            .collect();

        Self {
            pools,
            instance_types,
            existing,
            proposals: Vec::new(),
            topology,
            daemon_overhead,
            pool_remaining,
            excluded_pools: BTreeSet::new(),
            volume_requirements,
            batch,
            existing_assignments: Vec::new(),
            errors: BTreeMap::new(),
            next_node_index: 0,
        }
    }

    /// Deterministic batch order: priority descending, then CPU request
    /// descending (big rocks first), then name.
    fn order_batch(batch: &mut [Pod]) {
        batch.sort_by(|a, b| {
            let pa = a.spec.as_ref().and_then(|s| s.priority).unwrap_or(0);
            let pb = b.spec.as_ref().and_then(|s| s.priority).unwrap_or(0);
            pb.cmp(&pa)
                .then_with(|| {
                    let ca = pod_requests(a).map(|r| r.get("cpu")).unwrap_or(0);
                    let cb = pod_requests(b).map(|r| r.get("cpu")).unwrap_or(0);
                    cb.cmp(&ca)
                })
                .then_with(|| PodId::from_pod(a).cmp(&PodId::from_pod(b)))
        });
    }

    pub fn solve(mut self) -> SchedulingResults {
        let mut batch = std::mem::take(&mut self.batch);
        Self::order_batch(&mut batch);
        info!(pods = batch.len(), pools = self.pools.len(), "starting scheduling batch");

        for pod in batch {
            let id = PodId::from_pod(&pod);
            let mut relaxable = RelaxablePod::new(pod);
            loop {
                match self.schedule_one(&relaxable) {
                    Ok(()) => break,
                    Err(err) => match preferences::relax(&mut relaxable) {
                        Some(relaxed) => {
                            debug!(pod = %id, relaxed, "retrying after relaxing preference");
                        }
                        None => {
                            warn!(pod = %id, error = %err, "pod unschedulable");
                            self.errors.insert(id, err);
                            break;
                        }
                    },
                }
            }
        }

        info!(
            new_nodes = self.proposals.len(),
            existing = self.existing_assignments.len(),
            failed = self.errors.len(),
            "scheduling batch complete"
        );
        SchedulingResults {
            new_nodes: self.proposals,
            existing_assignments: self.existing_assignments,
            errors: self.errors,
        }
    }

    /// The pod's own node requirements, one alternative per required
    /// NodeSelectorTerm (OR semantics). Volume topology and the plain
    /// nodeSelector apply to every alternative.
    fn pod_requirement_alternatives(
        &self,
        pod: &Pod,
    ) -> Result<Vec<Requirements>, SchedulingError> {
        let id = PodId::from_pod(pod);
        let mut base = Requirements::new();
        for (key, value) in pod
            .spec
            .as_ref()
            .and_then(|s| s.node_selector.as_ref())
            .into_iter()
            .flatten()
        {
            base.add(Requirement::in_values(key, [value.clone()]))?;
        }
        if let Some(volume) = self.volume_requirements.get(&id) {
            base = base.intersect(volume)?;
        }

        let terms = pod
            .spec
            .as_ref()
            .and_then(|s| s.affinity.as_ref())
            .and_then(|a| a.node_affinity.as_ref())
            .and_then(|na| {
                na.required_during_scheduling_ignored_during_execution
                    .as_ref()
            })
            .map(|sel| sel.node_selector_terms.clone())
            .unwrap_or_default();
        if terms.is_empty() {
            return Ok(vec![base]);
        }

        let mut alternatives = Vec::new();
        let mut last_error = None;
        for term in &terms {
            match Requirements::from_node_selector_term(term)
                .and_then(|reqs| base.intersect(&reqs))
            {
                Ok(merged) => alternatives.push(merged),
                Err(err) => last_error = Some(err),
            }
        }
        if alternatives.is_empty() {
            return Err(last_error
                .map(SchedulingError::from)
                .unwrap_or(SchedulingError::PoolsExhausted));
        }
        Ok(alternatives)
    }

    fn schedule_one(&mut self, relaxable: &RelaxablePod) -> Result<(), SchedulingError> {
        let pod = &relaxable.pod;
        let requests = pod_requests(pod)
            .map_err(|e| SchedulingError::InsufficientResources(e.to_string()))?;
        let alternatives = self.pod_requirement_alternatives(pod)?;

        let mut last_error = SchedulingError::PoolsExhausted;
        for pod_reqs in &alternatives {
            // 1. Existing capacity.
            for node in &mut self.existing {
                match node.try_add(
                    &mut self.topology,
                    pod,
                    pod_reqs,
                    &requests,
                    relaxable.ignore_prefer_no_schedule,
                ) {
                    Ok(()) => {
                        self.existing_assignments.push(ExistingAssignment {
                            pod: PodId::from_pod(pod),
                            state_key: node.state_key.clone(),
                            node_name: node.name.clone(),
                        });
                        return Ok(());
                    }
                    Err(err) => last_error = err,
                }
            }

            // 2. Nodes this batch already decided to create.
            for proposal in &mut self.proposals {
                match proposal.try_add(
                    &mut self.topology,
                    pod,
                    pod_reqs,
                    &requests,
                    relaxable.ignore_prefer_no_schedule,
                ) {
                    Ok(()) => return Ok(()),
                    Err(err) => last_error = err,
                }
            }

            // 3. A fresh node, pools in weight order.
            for i in 0..self.pools.len() {
                let pool = self.pools[i].clone();
                let pool_name = pool.metadata.name.clone().unwrap_or_default();
                if self.excluded_pools.contains(&pool_name) {
                    continue;
                }
                let Some(instance_types) = self.instance_types.get(&pool_name).cloned() else {
                    continue;
                };
                let overhead = self
                    .daemon_overhead
                    .get(&pool_name)
                    .cloned()
                    .unwrap_or_default();
                let hostname = format!("{pool_name}-{}", self.next_node_index);

                let mut proposal =
                    match NodeProposal::from_pool(&pool, &instance_types, overhead, hostname) {
                        Ok(p) => p,
                        Err(err) => {
                            last_error = err;
                            continue;
                        }
                    };

                // Limits are enforced per pool against the aggregate this
                // batch would provision; an exhausted pool is dropped for
                // the whole batch and its pods retried elsewhere. Checked
                // before the placement attempt so an abandoned proposal
                // leaves no topology residue.
                let projected = proposal
                    .cheapest_instance()
                    .map(|it| it.capacity.clone())
                    .unwrap_or_default();
                if let Some(Some(remaining)) = self.pool_remaining.get(&pool_name)
                    && projected.exceeds(remaining).is_some()
                {
                    warn!(pool = %pool_name, "pool limits exhausted; dropping pool for batch");
                    self.excluded_pools.insert(pool_name.clone());
                    last_error = SchedulingError::PoolLimits(pool_name);
                    continue;
                }

                self.topology
                    .add_domain(apis::LABEL_HOSTNAME, &proposal.hostname);
                match proposal.try_add(
                    &mut self.topology,
                    pod,
                    pod_reqs,
                    &requests,
                    relaxable.ignore_prefer_no_schedule,
                ) {
                    Ok(()) => {}
                    Err(err) => {
                        last_error = err;
                        continue;
                    }
                }

                if let Some(Some(remaining)) = self.pool_remaining.get(&pool_name) {
                    let updated = remaining.saturating_sub(&projected);
                    self.pool_remaining.insert(pool_name.clone(), Some(updated));
                }

                self.next_node_index += 1;
                debug!(pool = %proposal.pool_name, hostname = %proposal.hostname, "proposed new node");
                self.proposals.push(proposal);
                return Ok(());
            }
        }
        Err(last_error)
    }
}
