//! The orchestration queue: drives each disruption command through
//! launch → wait-for-readiness → terminate, with retry, timeout, and full
//! rollback on failure.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Command;
use crate::apis;
use crate::events::{EventSink, Severity};
use crate::providers::provider::{CloudProvider, ProviderError};
use crate::state::Cluster;
use crate::store::{Store, StoreError};

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(10);
/// A command that hasn't completed in this long is rolled back.
const MAX_RETRY_DURATION: Duration = Duration::from_secs(600);
/// Eventual-consistency grace for a just-created replacement claim to
/// appear in the store.
const MISSING_CLAIM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("candidate {0} is already part of another command")]
    AlreadyDisrupting(String),

    #[error("replacement launch failed: {0}")]
    Launch(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Completed(Uuid),
    Requeued(Uuid),
    TimedOut(Uuid),
    Failed(Uuid, String),
}

struct QueuedCommand {
    command: Command,
    seq: u64,
    time_added: Instant,
    next_run: Instant,
    backoff: Duration,
    last_error: Option<String>,
}

#[derive(Default)]
struct QueueInner {
    commands: Vec<QueuedCommand>,
    /// providerIDs (state keys) owned by some in-flight command.
    tracked: HashSet<String>,
    next_seq: u64,
}

/// Single-consumer queue ordered by scheduled retry time. The queue and
/// its providerID index share one mutex.
pub struct OrchestrationQueue {
    inner: Mutex<QueueInner>,
    cluster: Arc<Cluster>,
    store: Arc<Store>,
    provider: Arc<CloudProvider>,
    events: Arc<EventSink>,
}

enum Disposition {
    Requeue,
    Done,
    Timeout,
    Unrecoverable(String),
}

impl OrchestrationQueue {
    pub fn new(
        cluster: Arc<Cluster>,
        store: Arc<Store>,
        provider: Arc<CloudProvider>,
        events: Arc<EventSink>,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            cluster,
            store,
            provider,
            events,
        }
    }

    pub fn contains(&self, state_key: &str) -> bool {
        self.inner.lock().unwrap().tracked.contains(state_key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rejects when any candidate already belongs to another command.
    pub fn can_add(&self, state_keys: &[String]) -> Result<(), QueueError> {
        let inner = self.inner.lock().unwrap();
        for key in state_keys {
            if inner.tracked.contains(key) {
                return Err(QueueError::AlreadyDisrupting(key.clone()));
            }
        }
        Ok(())
    }

    fn reserve(&self, state_keys: &[String]) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        for key in state_keys {
            if inner.tracked.contains(key) {
                return Err(QueueError::AlreadyDisrupting(key.clone()));
            }
        }
        for key in state_keys {
            inner.tracked.insert(key.clone());
        }
        Ok(())
    }

    fn release(&self, state_keys: &[String]) {
        let mut inner = self.inner.lock().unwrap();
        for key in state_keys {
            inner.tracked.remove(key);
        }
    }

    /// Reverse a partially-admitted command: remove applied taints, delete
    /// created claims, clear marks, free the candidates.
    async fn rollback_admission(&self, keys: &[String], tainted: &[String], created: &[String]) {
        for node in tainted {
            let _ = self
                .store
                .remove_node_taint(node, apis::TAINT_DISRUPTED_KEY)
                .await;
        }
        for claim in created {
            let _ = self.store.delete_node_claim(claim).await;
        }
        self.cluster.unmark_for_deletion(keys);
        self.release(keys);
    }

    /// Admit a command: reserve its candidates, mark them for deletion,
    /// taint their nodes, and launch its replacements. Every failure path
    /// reverses exactly what succeeded.
    pub async fn add(&self, mut command: Command) -> Result<(), QueueError> {
        let keys = command.state_keys();
        self.reserve(&keys)?;
        self.cluster.mark_for_deletion(&keys);

        let mut tainted: Vec<String> = Vec::new();
        let mut created: Vec<String> = Vec::new();

        for candidate in &command.candidates {
            if candidate.node_name.is_empty() {
                continue;
            }
            match self
                .store
                .add_node_taint(&candidate.node_name, apis::disrupted_taint())
                .await
            {
                Ok(()) => tainted.push(candidate.node_name.clone()),
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    self.rollback_admission(&keys, &tainted, &created).await;
                    return Err(err.into());
                }
            }
        }

        for replacement in &mut command.replacements {
            let name = replacement.name();
            let launch: Result<(), String> = async {
                self.store
                    .create_node_claim(&replacement.claim)
                    .await
                    .map_err(|e| e.to_string())?;
                created.push(name.clone());
                let realized = self
                    .provider
                    .create(&replacement.claim)
                    .await
                    .map_err(|e| match e {
                        ProviderError::InsufficientCapacity(msg) => msg,
                        other => other.to_string(),
                    })?;
                self.store
                    .update_node_claim(&realized)
                    .await
                    .map_err(|e| e.to_string())?;
                self.cluster.update_node_claim(&realized);
                replacement.claim = realized;
                Ok(())
            }
            .await;
            if let Err(msg) = launch {
                warn!(claim = %name, %msg, "replacement launch failed; rolling back command");
                self.rollback_admission(&keys, &tainted, &created).await;
                return Err(QueueError::Launch(msg));
            }
        }

        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        info!(
            command = %command.id,
            reason = %command.reason,
            candidates = command.candidates.len(),
            replacements = command.replacements.len(),
            "command admitted"
        );
        inner.commands.push(QueuedCommand {
            command,
            seq,
            time_added: now,
            next_run: now,
            backoff: BASE_DELAY,
            last_error: None,
        });
        Ok(())
    }

    fn pop_due(&self) -> Option<QueuedCommand> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let idx = inner
            .commands
            .iter()
            .enumerate()
            .filter(|(_, qc)| qc.next_run <= now)
            .min_by_key(|(_, qc)| (qc.next_run, qc.seq))
            .map(|(i, _)| i)?;
        Some(inner.commands.remove(idx))
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.inner
            .lock()
            .unwrap()
            .commands
            .iter()
            .map(|qc| qc.next_run)
            .min()
    }

    /// Process at most one due command.
    pub async fn reconcile_next(&self) -> Option<CommandOutcome> {
        let mut qc = self.pop_due()?;
        let id = qc.command.id;
        match self.process(&mut qc).await {
            Disposition::Requeue => {
                qc.next_run = Instant::now() + qc.backoff;
                qc.backoff = (qc.backoff * 2).min(MAX_DELAY);
                self.inner.lock().unwrap().commands.push(qc);
                Some(CommandOutcome::Requeued(id))
            }
            Disposition::Done => {
                self.release(&qc.command.state_keys());
                info!(command = %id, "command completed");
                Some(CommandOutcome::Completed(id))
            }
            Disposition::Timeout => {
                let error = qc
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "command did not complete in time".to_string());
                self.fail_command(&qc, &error).await;
                Some(CommandOutcome::TimedOut(id))
            }
            Disposition::Unrecoverable(error) => {
                self.fail_command(&qc, &error).await;
                Some(CommandOutcome::Failed(id, error))
            }
        }
    }

    async fn process(&self, qc: &mut QueuedCommand) -> Disposition {
        if qc.time_added.elapsed() >= MAX_RETRY_DURATION {
            return Disposition::Timeout;
        }

        // Launching: wait until every replacement claim is Initialized.
        let mut waiting = false;
        for replacement in &mut qc.command.replacements {
            if replacement.initialized {
                continue;
            }
            let name = replacement.name();
            match self.store.get_node_claim(&name).await {
                Ok(claim) if claim.is_initialized() => {
                    replacement.initialized = true;
                    debug!(command = %qc.command.id, claim = %name, "replacement initialized");
                }
                Ok(_) => {
                    self.events.emit(
                        Severity::Normal,
                        "WaitingOnReadiness",
                        &name,
                        "replacement node has not initialized",
                    );
                    waiting = true;
                }
                Err(err) if err.is_not_found() => {
                    if qc.time_added.elapsed() > MISSING_CLAIM_GRACE {
                        return Disposition::Unrecoverable(format!(
                            "replacement claim {name} disappeared"
                        ));
                    }
                    waiting = true;
                }
                Err(err) => {
                    qc.last_error = Some(err.to_string());
                    waiting = true;
                }
            }
        }
        if waiting {
            return Disposition::Requeue;
        }

        // Terminating: delete candidate claims; not-found is success.
        for candidate in &qc.command.candidates {
            match self.store.delete_node_claim(&candidate.claim_name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    qc.last_error = Some(err.to_string());
                    return Disposition::Requeue;
                }
            }
        }
        Disposition::Done
    }

    /// Leave the cluster exactly as it was before the command was added:
    /// no taint residue, no stray MarkForDeletion. Replacements that did
    /// initialize stay (they are valid capacity); the rest are cleaned up.
    async fn fail_command(&self, qc: &QueuedCommand, error: &str) {
        let keys = qc.command.state_keys();
        self.cluster.unmark_for_deletion(&keys);
        for candidate in &qc.command.candidates {
            if !candidate.node_name.is_empty() {
                let _ = self
                    .store
                    .remove_node_taint(&candidate.node_name, apis::TAINT_DISRUPTED_KEY)
                    .await;
            }
        }
        for replacement in &qc.command.replacements {
            if replacement.initialized {
                continue;
            }
            let name = replacement.name();
            // The flag can lag the store; a claim that managed to
            // initialize is valid capacity and stays.
            match self.store.get_node_claim(&name).await {
                Ok(claim) if claim.is_initialized() => {}
                _ => {
                    let _ = self.store.delete_node_claim(&name).await;
                }
            }
        }
        self.release(&keys);
        self.events.emit(
            Severity::Warning,
            "DisruptionFailed",
            &qc.command.id.to_string(),
            error,
        );
        warn!(command = %qc.command.id, error, "command failed; state restored");
    }

    /// Single consumer loop. Late-added commands never preempt a command
    /// already being processed.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let sleep_for = self
                .next_due()
                .map(|due| due.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(250))
                .max(Duration::from_millis(10));
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {
                    debug!("orchestration queue interrupted");
                    return;
                }
            }
            while self.reconcile_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::nodeclaim::{NodeClaim, condition};
    use crate::apis::nodepool::DisruptionReason;
    use crate::disruption::{CommandCandidate, Replacement};
    use crate::providers::fake::FakeCloudProvider;
    use crate::providers::kwok;
    use crate::store::FakeStore;
    use k8s_openapi::api::core::v1::Node;
    use std::collections::BTreeMap;

    struct Harness {
        queue: OrchestrationQueue,
        store: FakeStore,
        cluster: Arc<Cluster>,
    }

    fn harness() -> Harness {
        let store = FakeStore::new();
        let cluster = Arc::new(Cluster::new());
        let provider = FakeCloudProvider::new()
            .with_instance_types(vec![kwok::instance_type("c-2x", 2, 4_096, 0.01)]);
        let queue = OrchestrationQueue::new(
            cluster.clone(),
            Arc::new(Store::Fake(store.clone())),
            Arc::new(CloudProvider::Fake(provider)),
            Arc::new(EventSink::new()),
        );
        Harness {
            queue,
            store,
            cluster,
        }
    }

    fn seeded_candidate(h: &Harness, key: &str, claim: &str, node: &str) -> CommandCandidate {
        let node_obj = Node {
            metadata: kube::api::ObjectMeta {
                name: Some(node.to_string()),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::NodeSpec {
                provider_id: Some(key.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        h.store.add_node(node_obj.clone());
        h.cluster.update_node(&node_obj);
        let mut claim_obj = NodeClaim::new(claim, Default::default());
        claim_obj.metadata.labels = Some(BTreeMap::from([(
            apis::LABEL_NODEPOOL.to_string(),
            "default".to_string(),
        )]));
        claim_obj.status = Some(crate::apis::nodeclaim::NodeClaimStatus {
            provider_id: Some(key.to_string()),
            ..Default::default()
        });
        h.store.add_node_claim(claim_obj.clone());
        h.cluster.update_node_claim(&claim_obj);
        CommandCandidate {
            state_key: key.to_string(),
            claim_name: claim.to_string(),
            node_name: node.to_string(),
            pool_name: "default".to_string(),
        }
    }

    fn replacement_claim(name: &str) -> NodeClaim {
        let mut claim = NodeClaim::new(name, Default::default());
        claim.metadata.labels = Some(BTreeMap::from([(
            apis::LABEL_NODEPOOL.to_string(),
            "default".to_string(),
        )]));
        claim
    }

    fn command(candidates: Vec<CommandCandidate>, replacements: Vec<NodeClaim>) -> Command {
        Command {
            id: Uuid::new_v4(),
            reason: DisruptionReason::Underutilized,
            consolidation_type: "single",
            candidates,
            replacements: replacements
                .into_iter()
                .map(|claim| Replacement {
                    claim,
                    initialized: false,
                })
                .collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn add_marks_taints_and_guards_concurrency() {
        let h = harness();
        let candidate = seeded_candidate(&h, "fake:///1", "claim-a", "node-1");
        let cmd = command(vec![candidate.clone()], vec![]);
        h.queue.add(cmd).await.unwrap();

        assert!(h.queue.contains("fake:///1"));
        assert!(
            h.cluster
                .node_by_provider_id("fake:///1")
                .unwrap()
                .marked_for_deletion
        );
        let node = h.store.node("node-1").unwrap();
        assert!(
            node.spec
                .unwrap()
                .taints
                .unwrap()
                .iter()
                .any(|t| t.key == apis::TAINT_DISRUPTED_KEY)
        );

        // A second command over the same candidate is rejected.
        let dup = command(vec![candidate], vec![]);
        assert!(matches!(
            h.queue.add(dup).await,
            Err(QueueError::AlreadyDisrupting(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn replace_waits_for_initialization_then_terminates() {
        let h = harness();
        let candidate = seeded_candidate(&h, "fake:///1", "claim-a", "node-1");
        let cmd = command(vec![candidate], vec![replacement_claim("replacement-a")]);
        let id = cmd.id;
        h.queue.add(cmd).await.unwrap();

        // Replacement exists but is not initialized: requeue.
        assert_eq!(
            h.queue.reconcile_next().await,
            Some(CommandOutcome::Requeued(id))
        );
        assert!(h.store.deleted_claims().is_empty());

        h.store
            .set_claim_condition("replacement-a", condition::INITIALIZED, true);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            h.queue.reconcile_next().await,
            Some(CommandOutcome::Completed(id))
        );
        // Launch happened before termination, and only the candidate died.
        assert_eq!(h.store.deleted_claims(), vec!["claim-a".to_string()]);
        assert!(!h.queue.contains("fake:///1"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rolls_back_completely() {
        let h = harness();
        let candidate = seeded_candidate(&h, "fake:///1", "claim-a", "node-1");
        let cmd = command(vec![candidate], vec![replacement_claim("replacement-a")]);
        let id = cmd.id;
        h.queue.add(cmd).await.unwrap();

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(
            h.queue.reconcile_next().await,
            Some(CommandOutcome::TimedOut(id))
        );

        // Candidate state is exactly as before the command.
        assert!(
            !h.cluster
                .node_by_provider_id("fake:///1")
                .unwrap()
                .marked_for_deletion
        );
        let node = h.store.node("node-1").unwrap();
        assert!(
            node.spec
                .and_then(|s| s.taints)
                .map(|t| t.is_empty())
                .unwrap_or(true)
        );
        assert!(!h.queue.contains("fake:///1"));
        // The uninitialized replacement was cleaned up.
        assert!(h.store.deleted_claims().contains(&"replacement-a".to_string()));
        // The candidate claim was never deleted.
        assert!(!h.store.deleted_claims().contains(&"claim-a".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_and_caps() {
        let h = harness();
        let candidate = seeded_candidate(&h, "fake:///1", "claim-a", "node-1");
        let cmd = command(vec![candidate], vec![replacement_claim("replacement-a")]);
        h.queue.add(cmd).await.unwrap();

        // Repeated requeues stretch next_run by 1s, 2s, 4s... capped at 10s.
        let mut last_gap = Duration::ZERO;
        for _ in 0..6 {
            assert!(matches!(
                h.queue.reconcile_next().await,
                Some(CommandOutcome::Requeued(_))
            ));
            let gap = h
                .queue
                .next_due()
                .unwrap()
                .saturating_duration_since(Instant::now());
            assert!(gap >= last_gap);
            assert!(gap <= Duration::from_secs(10));
            last_gap = gap;
            tokio::time::advance(gap + Duration::from_millis(1)).await;
        }
        assert_eq!(last_gap, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_replacement_past_grace_is_unrecoverable() {
        let h = harness();
        let candidate = seeded_candidate(&h, "fake:///1", "claim-a", "node-1");
        let cmd = command(vec![candidate], vec![replacement_claim("replacement-a")]);
        let id = cmd.id;
        h.queue.add(cmd).await.unwrap();

        // Someone deletes the replacement claim out from under us.
        h.store.remove_claim("replacement-a");
        tokio::time::advance(Duration::from_secs(6)).await;
        match h.queue.reconcile_next().await {
            Some(CommandOutcome::Failed(got, _)) => assert_eq!(got, id),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(
            !h.cluster
                .node_by_provider_id("fake:///1")
                .unwrap()
                .marked_for_deletion
        );
    }
}
