//! Spec for a NodePool — the template governing a family of nodes and the
//! rules under which they may be disrupted.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::nodeclaim::NodeClaimSpec;
use crate::resources::ResourceList;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("weight {0} outside [1, 100]")]
    Weight(i32),

    #[error("unparseable duration {0:?}")]
    Duration(String),

    #[error("consolidateAfter must be Never (or unset) when policy is WhenUnderutilized")]
    ConsolidateAfterWithUnderutilized,

    #[error("consolidationPolicy WhenEmpty requires consolidateAfter")]
    WhenEmptyWithoutConsolidateAfter,

    #[error("unparseable cron schedule {0:?}")]
    Schedule(String),

    #[error("unknown time zone {0:?}")]
    TimeZone(String),

    #[error("unparseable datetime {0:?}")]
    DateTime(String),
}

/// A duration-valued policy field that can also be switched off entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionWindow {
    Never,
    After(Duration),
}

impl ActionWindow {
    pub fn parse(raw: Option<&str>) -> Result<Self, ValidationError> {
        match raw {
            None | Some("Never") => Ok(Self::Never),
            Some(s) => humantime::parse_duration(s)
                .map(Self::After)
                .map_err(|_| ValidationError::Duration(s.to_string())),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::After(d) => Some(*d),
        }
    }
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "canopy.sh", version = "v1alpha1", kind = "NodePool")]
#[kube(status = "NodePoolStatus")]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    pub template: NodeClaimTemplate,

    #[serde(default)]
    pub disruption: DisruptionSpec,

    /// Caps the aggregate resources provisioned from this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// Pools with higher weight are tried first during scheduling. 1..=100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimTemplate {
    #[serde(default)]
    pub metadata: TemplateObjectMeta,
    #[serde(default)]
    pub spec: NodeClaimSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionSpec {
    /// Duration a node must be idle/underutilized before consolidation may
    /// act on it. `"Never"` disables consolidation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidate_after: Option<String>,

    #[serde(default)]
    pub consolidation_policy: ConsolidationPolicy,

    /// Node lifetime after which it is replaced. Defaults to `"Never"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub budgets: Vec<Budget>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConsolidationPolicy {
    WhenEmpty,
    #[default]
    WhenUnderutilized,
}

/// A cron-windowed cap on concurrent disruptions.
///
/// When active, `nodes` (absolute count or percentage of the pool) caps
/// concurrent disruptions for the listed reasons; an absent `reasons` list
/// applies to all reasons. A budget whose window is not currently open
/// imposes no cap at all.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub nodes: IntOrString,

    /// Standard 5-field cron (or `@hourly` and friends). The budget is
    /// active for `duration` after each fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasons: Option<Vec<String>>,

    /// RFC 3339. The budget is inert outside [start, end].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date_time: Option<String>,

    /// IANA time zone the schedule is evaluated in. Defaults to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    /// Aggregate resources currently provisioned from this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Why a node is being disrupted. Provider-defined reasons pass through as
/// `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DisruptionReason {
    Empty,
    Underutilized,
    Drifted,
    Expired,
    All,
    Other(String),
}

impl From<&str> for DisruptionReason {
    fn from(s: &str) -> Self {
        match s {
            "Empty" => Self::Empty,
            "Underutilized" => Self::Underutilized,
            "Drifted" => Self::Drifted,
            "Expired" => Self::Expired,
            "All" => Self::All,
            other => Self::Other(other.to_string()),
        }
    }
}

impl FromStr for DisruptionReason {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl std::fmt::Display for DisruptionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Underutilized => write!(f, "Underutilized"),
            Self::Drifted => write!(f, "Drifted"),
            Self::Expired => write!(f, "Expired"),
            Self::All => write!(f, "All"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

impl DisruptionSpec {
    pub fn consolidate_after(&self) -> Result<ActionWindow, ValidationError> {
        ActionWindow::parse(self.consolidate_after.as_deref())
    }

    pub fn expire_after(&self) -> Result<ActionWindow, ValidationError> {
        ActionWindow::parse(self.expire_after.as_deref())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let consolidate_after = self.consolidate_after()?;
        self.expire_after()?;
        match self.consolidation_policy {
            ConsolidationPolicy::WhenUnderutilized => {
                if matches!(consolidate_after, ActionWindow::After(_)) {
                    return Err(ValidationError::ConsolidateAfterWithUnderutilized);
                }
            }
            ConsolidationPolicy::WhenEmpty => {
                if self.consolidate_after.is_none() {
                    return Err(ValidationError::WhenEmptyWithoutConsolidateAfter);
                }
            }
        }
        for budget in &self.budgets {
            budget.validate()?;
        }
        Ok(())
    }
}

impl Budget {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(schedule) = &self.schedule {
            crate::budgets::parse_schedule(schedule)
                .map_err(|_| ValidationError::Schedule(schedule.clone()))?;
        }
        if let Some(duration) = &self.duration {
            humantime::parse_duration(duration)
                .map_err(|_| ValidationError::Duration(duration.clone()))?;
        }
        if let Some(tz) = &self.tz {
            tz.parse::<chrono_tz::Tz>()
                .map_err(|_| ValidationError::TimeZone(tz.clone()))?;
        }
        for field in [&self.start_date_time, &self.end_date_time]
            .into_iter()
            .flatten()
        {
            chrono::DateTime::parse_from_rfc3339(field)
                .map_err(|_| ValidationError::DateTime(field.clone()))?;
        }
        Ok(())
    }

    pub fn reasons(&self) -> Option<Vec<DisruptionReason>> {
        self.reasons
            .as_ref()
            .map(|rs| rs.iter().map(|r| DisruptionReason::from(r.as_str())).collect())
    }
}

impl NodePool {
    pub fn weight(&self) -> i32 {
        self.spec.weight.unwrap_or(1)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(weight) = self.spec.weight
            && !(1..=100).contains(&weight)
        {
            return Err(ValidationError::Weight(weight));
        }
        self.spec.disruption.validate()
    }

    /// Sort key: weight descending, then name for determinism.
    pub fn ordering_key(&self) -> (i32, String) {
        (
            -self.weight(),
            self.metadata.name.clone().unwrap_or_default(),
        )
    }
}
