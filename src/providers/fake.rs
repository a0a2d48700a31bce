use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::apis::nodeclaim::NodeClaim;
use crate::apis::nodepool::NodePool;
use crate::providers::provider::{InstanceType, ProviderError};

/// What happens on the next `create()` call.
#[derive(Debug, Clone)]
pub enum CreateBehavior {
    /// Happy path — allocates an instance from the catalog.
    Succeed,
    /// The catalog has no capacity for the requested shape.
    InsufficientCapacity,
    /// Network/API blowup.
    InternalError(String),
}

/// What happens on the next `delete()` call.
#[derive(Debug, Clone)]
pub enum DeleteBehavior {
    Succeed,
    /// The instance is already gone.
    NotFound,
    InternalError(String),
}

/// Logged record of a `create()` call.
#[derive(Debug, Clone)]
pub struct CreateCall {
    pub claim_name: String,
    pub provider_id: Option<String>,
}

/// Logged record of a `delete()` call.
#[derive(Debug, Clone)]
pub struct DeleteCall {
    pub provider_id: Option<String>,
}

/// Interior state behind the Arc<Mutex<_>>.
#[derive(Default)]
struct FakeState {
    instance_types: Vec<InstanceType>,
    create_behaviors: VecDeque<CreateBehavior>,
    delete_behaviors: VecDeque<DeleteBehavior>,
    instances: HashMap<String, NodeClaim>,
    drifted: HashMap<String, String>,
    create_calls: Vec<CreateCall>,
    delete_calls: Vec<DeleteCall>,
}

/// A deterministic, in-memory cloud provider for testing failure modes.
///
/// Each call to `create()`/`delete()` pops the next behavior from a queue;
/// an empty queue means the happy path. Created instances are remembered so
/// `get`/`list` behave like a real provider.
#[derive(Clone, Default)]
pub struct FakeCloudProvider {
    state: Arc<Mutex<FakeState>>,
    next_id: Arc<AtomicU64>,
}

impl FakeCloudProvider {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Builder methods ──────────────────────────────────────────────

    pub fn with_instance_types(self, instance_types: Vec<InstanceType>) -> Self {
        self.state.lock().unwrap().instance_types = instance_types;
        self
    }

    pub fn on_next_create(self, behavior: CreateBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .create_behaviors
            .push_back(behavior);
        self
    }

    pub fn on_next_delete(self, behavior: DeleteBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .delete_behaviors
            .push_back(behavior);
        self
    }

    /// Mark an instance as drifted so `is_drifted` reports the reason.
    pub fn set_drifted(&self, provider_id: &str, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .drifted
            .insert(provider_id.to_string(), reason.to_string());
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn create_calls(&self) -> Vec<CreateCall> {
        self.state.lock().unwrap().create_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    // ── Provider implementation ──────────────────────────────────────

    pub async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim, ProviderError> {
        fail::fail_point!("cloudprovider-create", |_| {
            Err(ProviderError::Internal(anyhow::anyhow!(
                "injected create failure"
            )))
        });
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state
                .create_behaviors
                .pop_front()
                .unwrap_or(CreateBehavior::Succeed)
        };
        let claim_name = claim.metadata.name.clone().unwrap_or_default();

        let result = match behavior {
            CreateBehavior::Succeed => {
                let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                let provider_id = format!("fake:///instance-{n}");
                let state = self.state.lock().unwrap();
                let catalog = state.instance_types.clone();
                drop(state);
                match super::kwok::realize_claim(claim, &catalog, &provider_id) {
                    Some(realized) => {
                        self.state
                            .lock()
                            .unwrap()
                            .instances
                            .insert(provider_id.clone(), realized.clone());
                        Ok(realized)
                    }
                    None => Err(ProviderError::InsufficientCapacity(format!(
                        "no instance type satisfies {claim_name}"
                    ))),
                }
            }
            CreateBehavior::InsufficientCapacity => Err(ProviderError::InsufficientCapacity(
                format!("no capacity for {claim_name}"),
            )),
            CreateBehavior::InternalError(msg) => {
                Err(ProviderError::Internal(anyhow::anyhow!(msg)))
            }
        };

        self.state.lock().unwrap().create_calls.push(CreateCall {
            claim_name,
            provider_id: result
                .as_ref()
                .ok()
                .and_then(|c| c.provider_id().map(str::to_string)),
        });
        result
    }

    pub async fn delete(&self, claim: &NodeClaim) -> Result<(), ProviderError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state
                .delete_behaviors
                .pop_front()
                .unwrap_or(DeleteBehavior::Succeed)
        };
        let provider_id = claim.provider_id().map(str::to_string);
        self.state.lock().unwrap().delete_calls.push(DeleteCall {
            provider_id: provider_id.clone(),
        });

        match behavior {
            DeleteBehavior::Succeed => {
                if let Some(id) = provider_id {
                    self.state.lock().unwrap().instances.remove(&id);
                }
                Ok(())
            }
            DeleteBehavior::NotFound => Err(ProviderError::NotFound(
                provider_id.unwrap_or_default(),
            )),
            DeleteBehavior::InternalError(msg) => {
                Err(ProviderError::Internal(anyhow::anyhow!(msg)))
            }
        }
    }

    pub async fn get(&self, provider_id: &str) -> Result<NodeClaim, ProviderError> {
        self.state
            .lock()
            .unwrap()
            .instances
            .get(provider_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<NodeClaim>, ProviderError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .instances
            .values()
            .cloned()
            .collect())
    }

    pub async fn instance_types(
        &self,
        _pool: &NodePool,
    ) -> Result<Vec<InstanceType>, ProviderError> {
        Ok(self.state.lock().unwrap().instance_types.clone())
    }

    pub async fn is_drifted(&self, claim: &NodeClaim) -> Result<Option<String>, ProviderError> {
        Ok(claim
            .provider_id()
            .and_then(|id| self.state.lock().unwrap().drifted.get(id).cloned()))
    }
}
