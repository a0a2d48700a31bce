//! Disruption: detect nodes whose capacity is no longer justified, select
//! commands under per-pool budgets, and hand them to the orchestration
//! queue.

pub mod candidate;
pub mod consolidation;
pub mod emptiness;
pub mod eventual;
pub mod multinode;
pub mod queue;
pub mod singlenode;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::apis::nodeclaim::{NodeClaim, condition, jiff_to_chrono};
use crate::apis::nodepool::{ActionWindow, DisruptionReason, NodePool};
use crate::budgets;
use crate::events::{EventSink, Severity};
use crate::providers::provider::CloudProvider;
use crate::provisioning::{SchedulerInputs, gather_inputs};
use crate::requirements::Requirements;
use crate::resources::PodId;
use crate::scheduling::volume;
use crate::state::Cluster;
use crate::store::Store;
use candidate::{Candidate, build_candidate, sort_candidates};
use queue::OrchestrationQueue;

/// One node being removed by a command.
#[derive(Debug, Clone)]
pub struct CommandCandidate {
    pub state_key: String,
    pub claim_name: String,
    pub node_name: String,
    pub pool_name: String,
}

/// One node being created by a command.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub claim: NodeClaim,
    pub initialized: bool,
}

impl Replacement {
    pub fn name(&self) -> String {
        self.claim.metadata.name.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Command {
    pub id: Uuid,
    pub reason: DisruptionReason,
    pub consolidation_type: &'static str,
    pub candidates: Vec<CommandCandidate>,
    pub replacements: Vec<Replacement>,
}

impl Command {
    pub fn new(
        reason: DisruptionReason,
        consolidation_type: &'static str,
        candidates: &[&Candidate],
        replacement_claims: Vec<NodeClaim>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason,
            consolidation_type,
            candidates: candidates
                .iter()
                .map(|c| CommandCandidate {
                    state_key: c.state_key.clone(),
                    claim_name: c.claim_name(),
                    node_name: c.node_name(),
                    pool_name: c.pool_name.clone(),
                })
                .collect(),
            replacements: replacement_claims
                .into_iter()
                .map(|claim| Replacement {
                    claim,
                    initialized: false,
                })
                .collect(),
        }
    }

    pub fn state_keys(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.state_key.clone()).collect()
    }

    pub fn is_replace(&self) -> bool {
        !self.replacements.is_empty()
    }
}

/// Inputs shared by every method's command computation.
pub struct MethodContext<'a> {
    pub candidates: &'a [Candidate],
    pub inputs: &'a SchedulerInputs,
    pub volume: &'a BTreeMap<PodId, Requirements>,
    pub pools: &'a BTreeMap<String, NodePool>,
    pub now: DateTime<Utc>,
    pub timeout: Duration,
}

/// The disruption methods, as tagged variants so the controller can rotate
/// through them without dynamic dispatch.
pub enum Method {
    Emptiness(emptiness::Emptiness),
    Eventual(eventual::Eventual),
    MultiNode(multinode::MultiNode),
    SingleNode(singlenode::SingleNode),
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Emptiness(_) => "emptiness",
            Self::Eventual(_) => "eventual",
            Self::MultiNode(_) => "multi-node-consolidation",
            Self::SingleNode(_) => "single-node-consolidation",
        }
    }

    pub fn consolidation_type(&self) -> &'static str {
        match self {
            Self::Emptiness(_) => "empty",
            Self::Eventual(_) => "",
            Self::MultiNode(_) => "multi",
            Self::SingleNode(_) => "single",
        }
    }

    pub fn is_consolidation(&self) -> bool {
        matches!(self, Self::Emptiness(_) | Self::MultiNode(_) | Self::SingleNode(_))
    }

    pub fn should_disrupt(&self, pool: &NodePool, c: &Candidate, now: DateTime<Utc>) -> bool {
        match self {
            Self::Emptiness(m) => m.should_disrupt(pool, c, now),
            Self::Eventual(m) => m.should_disrupt(pool, c, now),
            Self::MultiNode(m) => m.should_disrupt(pool, c, now),
            Self::SingleNode(m) => m.should_disrupt(pool, c, now),
        }
    }

    /// The budget reason this candidate would be disrupted under.
    pub fn candidate_reason(&self, c: &Candidate) -> DisruptionReason {
        match self {
            Self::Emptiness(_) => DisruptionReason::Empty,
            Self::Eventual(m) => m.candidate_reason(c),
            Self::MultiNode(_) | Self::SingleNode(_) => DisruptionReason::Underutilized,
        }
    }

    pub fn compute_command(&self, ctx: &MethodContext) -> Option<Command> {
        match self {
            Self::Emptiness(m) => m.compute_command(ctx),
            Self::Eventual(m) => m.compute_command(ctx),
            Self::MultiNode(m) => m.compute_command(ctx),
            Self::SingleNode(m) => m.compute_command(ctx),
        }
    }
}

pub struct DisruptionController {
    store: Arc<Store>,
    provider: Arc<CloudProvider>,
    cluster: Arc<Cluster>,
    queue: Arc<OrchestrationQueue>,
    events: Arc<EventSink>,
    methods: Vec<Method>,
    validation_ttl: Duration,
    consolidation_timeout: Duration,
    multi_consolidation_timeout: Duration,
}

impl DisruptionController {
    pub fn new(
        store: Arc<Store>,
        provider: Arc<CloudProvider>,
        cluster: Arc<Cluster>,
        queue: Arc<OrchestrationQueue>,
        events: Arc<EventSink>,
        validation_ttl: Duration,
        consolidation_timeout: Duration,
        multi_consolidation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            cluster,
            queue,
            events,
            methods: vec![
                Method::Emptiness(emptiness::Emptiness),
                Method::Eventual(eventual::Eventual),
                Method::MultiNode(multinode::MultiNode),
                Method::SingleNode(singlenode::SingleNode),
            ],
            validation_ttl,
            consolidation_timeout,
            multi_consolidation_timeout,
        }
    }

    /// Refresh the status conditions the methods key on: Empty, Drifted,
    /// Expired, Consolidatable.
    async fn refresh_conditions(
        &self,
        pools: &BTreeMap<String, NodePool>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for (_, state) in self.cluster.nodes_with_keys() {
            let Some(mut claim) = state.node_claim.clone() else {
                continue;
            };
            let Some(pool) = state.pool_name().and_then(|p| pools.get(&p)) else {
                continue;
            };

            let empty = state.reschedulable_pod_ids().is_empty();
            claim.set_condition(
                condition::EMPTY,
                empty,
                if empty { "Empty" } else { "NotEmpty" },
                "",
                now,
            );

            if let Ok(Some(reason)) = self.provider.is_drifted(&claim).await {
                claim.set_condition(condition::DRIFTED, true, &reason, "", now);
            } else {
                claim.clear_condition(condition::DRIFTED);
            }

            if let Ok(ActionWindow::After(expire_after)) = pool.spec.disruption.expire_after() {
                let expired = claim
                    .metadata
                    .creation_timestamp
                    .as_ref()
                    .map(|t| now - jiff_to_chrono(t.0) >= chrono::Duration::from_std(expire_after).unwrap_or_else(|_| chrono::Duration::zero()))
                    .unwrap_or(false);
                claim.set_condition(
                    condition::EXPIRED,
                    expired,
                    if expired { "TTLExpired" } else { "NotExpired" },
                    "",
                    now,
                );
            }

            let consolidatable = consolidation::consolidation_enabled(pool)
                && consolidation::past_consolidate_after(pool, &claim, now);
            claim.set_condition(
                condition::CONSOLIDATABLE,
                consolidatable,
                if consolidatable { "Consolidatable" } else { "NotConsolidatable" },
                "",
                now,
            );

            if self.store.update_node_claim_status(&claim).await.is_ok() {
                self.cluster.update_node_claim(&claim);
            }
        }
        Ok(())
    }

    async fn build_candidates(
        &self,
        inputs: &SchedulerInputs,
        pools: &BTreeMap<String, NodePool>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for (key, state) in &inputs.snapshot {
            let node_name = state.node_name().unwrap_or_default();
            let pods = if node_name.is_empty() {
                vec![]
            } else {
                self.store.list_pods_on_node(&node_name).await?
            };
            match build_candidate(
                key,
                state,
                pools,
                &inputs.instance_types,
                &pods,
                self.queue.contains(key),
                now,
            ) {
                Ok(candidate) => candidates.push(candidate),
                Err(reason) => {
                    debug!(node = %state.name(), %reason, "not a disruption candidate");
                }
            }
        }
        sort_candidates(&mut candidates);
        Ok(candidates)
    }

    /// One disruption pass. Returns true when a command was queued.
    pub async fn reconcile_once(&self) -> Result<bool> {
        let now = Utc::now();
        let claims = self.store.list_node_claims().await?;
        let nodes = self.store.list_nodes().await?;
        if !self.cluster.synced(&claims, &nodes) {
            debug!("cluster state not yet synced; skipping disruption");
            return Ok(false);
        }

        let inputs = gather_inputs(&self.store, &self.provider, &self.cluster).await?;
        let pools: BTreeMap<String, NodePool> = inputs
            .pools
            .iter()
            .map(|p| (p.metadata.name.clone().unwrap_or_default(), p.clone()))
            .collect();

        self.refresh_conditions(&pools, now).await?;
        // Conditions may have changed claims; rebuild the snapshot view.
        let inputs = gather_inputs(&self.store, &self.provider, &self.cluster).await?;
        let candidates = self.build_candidates(&inputs, &pools, now).await?;

        // Per-pool, per-reason allowances, with in-flight disruptions and
        // NotReady nodes already subtracted.
        let mut allowances: BTreeMap<String, BTreeMap<DisruptionReason, i32>> = BTreeMap::new();
        for (name, pool) in &pools {
            let pool_nodes: Vec<_> = inputs
                .snapshot
                .iter()
                .filter(|(_, s)| s.pool_name().as_deref() == Some(name.as_str()))
                .collect();
            let disrupting = pool_nodes
                .iter()
                .filter(|(_, s)| s.marked_for_deletion || (s.node.is_some() && !s.node_ready()))
                .count();
            allowances.insert(
                name.clone(),
                budgets::build_disruption_budgets(pool, now, pool_nodes.len(), disrupting)?,
            );
        }

        let mut volume_requirements: BTreeMap<PodId, Requirements> = BTreeMap::new();
        for c in &candidates {
            for pod in &c.reschedulable_pods {
                let id = PodId::from_pod(pod);
                if let Ok(reqs) = volume::volume_requirements(&self.store, pod).await {
                    volume_requirements.insert(id, reqs);
                }
            }
        }

        let mut any_consolidation_attempted = false;
        for method in &self.methods {
            let eligible = self.eligible_for(method, &candidates, &pools, &allowances, now);
            if eligible.is_empty() {
                continue;
            }
            if method.is_consolidation() {
                any_consolidation_attempted = true;
                if self.cluster.consolidated(now) {
                    continue;
                }
            }

            let timeout = match method {
                Method::MultiNode(_) => self.multi_consolidation_timeout,
                _ => self.consolidation_timeout,
            };
            let ctx = MethodContext {
                candidates: &eligible,
                inputs: &inputs,
                volume: &volume_requirements,
                pools: &pools,
                now,
                timeout,
            };
            let Some(command) = method.compute_command(&ctx) else {
                continue;
            };
            info!(
                method = method.name(),
                reason = %command.reason,
                candidates = command.candidates.len(),
                replacements = command.replacements.len(),
                "computed disruption command"
            );

            // Shared validation: wait, then re-check against fresh state. An
            // invalidated command is discarded, never retried.
            tokio::time::sleep(self.validation_ttl).await;
            if !self.validate_command(method, &command, &pools).await? {
                self.events.emit(
                    Severity::Normal,
                    "DisruptionValidationFailed",
                    &command.id.to_string(),
                    "cluster changed during validation; discarding command",
                );
                continue;
            }

            self.queue.add(command).await?;
            return Ok(true);
        }

        if any_consolidation_attempted {
            // Consolidation scanned and found nothing; cache the verdict
            // until cluster state changes.
            self.cluster.mark_consolidated(Utc::now());
        }
        Ok(false)
    }

    fn eligible_for(
        &self,
        method: &Method,
        candidates: &[Candidate],
        pools: &BTreeMap<String, NodePool>,
        allowances: &BTreeMap<String, BTreeMap<DisruptionReason, i32>>,
        now: DateTime<Utc>,
    ) -> Vec<Candidate> {
        let mut taken: BTreeMap<(String, DisruptionReason), i32> = BTreeMap::new();
        let mut eligible = Vec::new();
        for c in candidates {
            let Some(pool) = pools.get(&c.pool_name) else {
                continue;
            };
            if !method.should_disrupt(pool, c, now) {
                continue;
            }
            let reason = method.candidate_reason(c);
            let allowed = allowances
                .get(&c.pool_name)
                .and_then(|m| m.get(&reason).copied())
                .unwrap_or(i32::MAX);
            let used = taken
                .entry((c.pool_name.clone(), reason.clone()))
                .or_insert(0);
            if *used >= allowed {
                self.events.emit(
                    Severity::Normal,
                    "DisruptionBlocked",
                    &format!("{}/{}", c.pool_name, reason),
                    "budget exhausted for reason",
                );
                continue;
            }
            *used += 1;
            eligible.push(c.clone());
        }
        eligible
    }

    /// Re-derive the candidate set and confirm every node in the command is
    /// still disruptable the same way.
    async fn validate_command(
        &self,
        method: &Method,
        command: &Command,
        pools: &BTreeMap<String, NodePool>,
    ) -> Result<bool> {
        let now = Utc::now();
        let inputs = gather_inputs(&self.store, &self.provider, &self.cluster).await?;
        let fresh = self.build_candidates(&inputs, pools, now).await?;
        for wanted in &command.candidates {
            let Some(candidate) = fresh.iter().find(|c| c.state_key == wanted.state_key) else {
                return Ok(false);
            };
            let Some(pool) = pools.get(&candidate.pool_name) else {
                return Ok(false);
            };
            if !method.should_disrupt(pool, candidate, now) {
                return Ok(false);
            }
            // A delete command must still be a delete: new pods landing on
            // the node invalidate it.
            if !command.is_replace() && !candidate.is_empty() && method.consolidation_type() == "empty"
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    debug!("disruption controller interrupted");
                    return;
                }
            }
            match self.reconcile_once().await {
                Ok(true) => debug!("disruption command queued"),
                Ok(false) => {}
                Err(err) => warn!(error = %err, "disruption pass failed; will retry"),
            }
        }
    }
}
