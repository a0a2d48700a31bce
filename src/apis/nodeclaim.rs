//! Spec for a NodeClaim — a request for one prospective or realized node.
//!
//! NodeClaims track node provisioning through a lifecycle:
//! Created → Registered (providerID assigned) → Initialized → Deleted.
//! A NodeClaim is owned by a NodePool and realized by the cloud provider.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::requirements::{Operator, Requirement, Requirements, RequirementsError};
use crate::resources::ResourceList;

/// Converts a Kubernetes `Time` (backed by `jiff::Timestamp`) into a
/// `chrono::DateTime<Utc>` for use with the rest of the codebase's
/// chrono-based time arithmetic.
pub fn jiff_to_chrono(ts: k8s_openapi::jiff::Timestamp) -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::SystemTime::from(ts))
}

/// Converts a `chrono::DateTime<Utc>` into the `jiff::Timestamp` expected by
/// `k8s_openapi::apimachinery::pkg::apis::meta::v1::Time`.
pub fn chrono_to_jiff(dt: DateTime<Utc>) -> k8s_openapi::jiff::Timestamp {
    k8s_openapi::jiff::Timestamp::try_from(std::time::SystemTime::from(dt))
        .expect("chrono::DateTime<Utc> is always representable as a jiff::Timestamp")
}

/// Condition types carried on NodeClaim status.
pub mod condition {
    pub const INITIALIZED: &str = "Initialized";
    pub const EMPTY: &str = "Empty";
    pub const DRIFTED: &str = "Drifted";
    pub const EXPIRED: &str = "Expired";
    pub const CONSOLIDATABLE: &str = "Consolidatable";
    pub const CONSISTENT_STATE_FOUND: &str = "ConsistentStateFound";
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "canopy.sh", version = "v1alpha1", kind = "NodeClaim")]
#[kube(status = "NodeClaimStatus")]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    /// Constraints the provisioned node must satisfy, resolved against the
    /// owning pool's instance catalog.
    #[serde(default)]
    pub requirements: Vec<RequirementSpec>,

    /// Minimum resources the node must offer; informs instance selection.
    #[serde(default)]
    pub resources: ResourceRequestsSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Taints removed by the node bootstrap; their presence blocks
    /// initialization but not registration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub startup_taints: Vec<Taint>,

    /// Provider-specific node configuration this claim is built from.
    #[serde(default)]
    pub node_class_ref: NodeClassReference,
}

/// A node selector requirement plus a minimum value-set cardinality that
/// the scheduler must preserve when it tightens requirements.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequirementSpec {
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_values: Option<u32>,
}

impl RequirementSpec {
    pub fn to_requirement(&self) -> Result<Requirement, RequirementsError> {
        let op = Operator::parse(&self.operator)?;
        let mut req = Requirement::new(&self.key, op, self.values.clone().unwrap_or_default())?;
        if let Some(min) = self.min_values {
            req = req.with_min_values(min);
        }
        Ok(req)
    }

    pub fn from_requirement(req: &Requirement) -> Self {
        let values = match req.operator() {
            Operator::In => Some(req.values()),
            Operator::NotIn => Some(req.denied_values()),
            Operator::Gt | Operator::Lt => req.bound().map(|b| vec![b.to_string()]),
            Operator::Exists | Operator::DoesNotExist => None,
        };
        Self {
            key: req.key().to_string(),
            operator: req.operator().as_str().to_string(),
            values: values.filter(|v| !v.is_empty()),
            min_values: req.min_values,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequestsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeClassReference {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    /// Set when the cloud provider has created the backing instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocatable: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodeClaim {
    pub fn provider_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn pool_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(super::LABEL_NODEPOOL))
            .map(String::as_str)
    }

    pub fn status_condition(&self, type_: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
            .iter()
            .find(|c| c.type_ == type_)
    }

    pub fn condition_is_true(&self, type_: &str) -> bool {
        self.status_condition(type_)
            .map(|c| c.status == "True")
            .unwrap_or(false)
    }

    pub fn is_registered(&self) -> bool {
        self.provider_id().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.condition_is_true(condition::INITIALIZED)
    }

    /// Set or update a condition, preserving the transition time when the
    /// status value does not change.
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let status_str = if status { "True" } else { "False" };
        let st = self.status.get_or_insert_with(Default::default);
        let generation = self.metadata.generation;
        if let Some(existing) = st.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status_str {
                existing.last_transition_time = Time(chrono_to_jiff(now));
            }
            existing.status = status_str.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = generation;
            return;
        }
        st.conditions.push(Condition {
            last_transition_time: Time(chrono_to_jiff(now)),
            message: message.to_string(),
            observed_generation: generation,
            reason: reason.to_string(),
            status: status_str.to_string(),
            type_: type_.to_string(),
        });
    }

    pub fn clear_condition(&mut self, type_: &str) {
        if let Some(st) = self.status.as_mut() {
            st.conditions.retain(|c| c.type_ != type_);
        }
    }

    /// The claim's requirements in algebra form.
    pub fn requirements(&self) -> Result<Requirements, RequirementsError> {
        let mut out = Requirements::new();
        for spec in &self.spec.requirements {
            out.add(spec.to_requirement()?)?;
        }
        // Labels on the claim are constraints too.
        for (key, value) in self.metadata.labels.iter().flatten() {
            out.add(Requirement::in_values(key, [value.clone()]))?;
        }
        Ok(out)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    pub fn has_do_not_disrupt(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(super::ANNOTATION_DO_NOT_DISRUPT))
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

/// Give a claim a unique name derived from its pool and keep the hostname
/// label in step. Proposed nodes carry a batch-internal hostname until the
/// claim is actually created.
pub fn finalize_name(claim: &mut NodeClaim) {
    let pool = claim.pool_name().unwrap_or("node").to_string();
    let suffix = Uuid::new_v4().simple().to_string();
    let name = format!("{pool}-{}", &suffix[..8]);
    claim.metadata.name = Some(name.clone());
    claim
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(super::LABEL_HOSTNAME.to_string(), name);
}
