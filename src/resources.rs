//! Resource quantity bookkeeping.
//!
//! Everything downstream (the scheduler, the state mirror, consolidation)
//! compares and subtracts resource amounts constantly, so quantities are
//! parsed once into integer milli-units and kept that way. CPU "100m" is
//! 100, memory "1Gi" is 1073741824000, one pod slot is 1000 under `pods`.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

pub type ResourceList = BTreeMap<String, Quantity>;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_PODS: &str = "pods";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResourceError {
    #[error("unparseable quantity {0:?}")]
    Unparseable(String),
}

/// Parse a Kubernetes quantity into milli-units.
///
/// Binary (Ki/Mi/Gi/Ti/Pi) and decimal (k/M/G/T/P) suffixes are supported,
/// along with the `m` milli suffix and bare decimals.
pub fn parse_quantity(q: &Quantity) -> Result<i64, ResourceError> {
    let s = q.0.trim();
    if s.is_empty() {
        return Err(ResourceError::Unparseable(q.0.clone()));
    }
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| ResourceError::Unparseable(q.0.clone()))?;
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 0.001,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0f64.powi(4),
        "Pi" => 1024.0f64.powi(5),
        _ => return Err(ResourceError::Unparseable(q.0.clone())),
    };
    Ok((value * multiplier * 1000.0).round() as i64)
}

fn format_milli(name: &str, milli: i64) -> Quantity {
    if name == RESOURCE_CPU {
        Quantity(format!("{milli}m"))
    } else if milli % 1000 == 0 {
        Quantity(format!("{}", milli / 1000))
    } else {
        Quantity(format!("{milli}m"))
    }
}

/// A set of resource amounts in milli-units, keyed by resource name.
///
/// Missing keys read as zero, which makes `fits` and subtraction behave the
/// way scheduling wants without sprinkling `unwrap_or(0)` everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSet(BTreeMap<String, i64>);

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_list(list: &ResourceList) -> Result<Self, ResourceError> {
        let mut out = BTreeMap::new();
        for (name, quantity) in list {
            out.insert(name.clone(), parse_quantity(quantity)?);
        }
        Ok(Self(out))
    }

    pub fn to_list(&self) -> ResourceList {
        self.0
            .iter()
            .map(|(name, milli)| (name.clone(), format_milli(name, *milli)))
            .collect()
    }

    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, milli: i64) {
        self.0.insert(name.to_string(), milli);
    }

    pub fn with(mut self, name: &str, milli: i64) -> Self {
        self.set(name, milli);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &i64)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    pub fn add(&mut self, other: &ResourceSet) {
        for (name, milli) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += milli;
        }
    }

    /// Signed subtraction over the union of keys. Callers that must not go
    /// negative use [`ResourceSet::saturating_sub`].
    pub fn sub(&self, other: &ResourceSet) -> ResourceSet {
        let mut out = self.0.clone();
        for (name, milli) in &other.0 {
            *out.entry(name.clone()).or_insert(0) -= milli;
        }
        ResourceSet(out)
    }

    pub fn saturating_sub(&self, other: &ResourceSet) -> ResourceSet {
        let mut out = self.sub(other);
        for v in out.0.values_mut() {
            *v = (*v).max(0);
        }
        out
    }

    /// Per-key maximum over the union of keys.
    pub fn merge_max(&self, other: &ResourceSet) -> ResourceSet {
        let mut out = self.0.clone();
        for (name, milli) in &other.0 {
            let entry = out.entry(name.clone()).or_insert(0);
            *entry = (*entry).max(*milli);
        }
        ResourceSet(out)
    }

    /// True when every amount in `self` fits within `avail`.
    pub fn fits(&self, avail: &ResourceSet) -> bool {
        self.0.iter().all(|(name, milli)| *milli <= avail.get(name))
    }

    /// The first resource for which `self` exceeds `limits`. Limits only
    /// constrain the resources they name.
    pub fn exceeds(&self, limits: &ResourceSet) -> Option<String> {
        limits
            .0
            .iter()
            .find(|(name, limit)| self.get(name) > **limit)
            .map(|(name, _)| name.clone())
    }

    pub fn any_negative(&self) -> bool {
        self.0.values().any(|v| *v < 0)
    }
}

/// Effective scheduling requests for a pod: the elementwise max of the sum
/// of container requests and the largest init-container request, plus pod
/// overhead and one `pods` slot.
pub fn pod_requests(pod: &Pod) -> Result<ResourceSet, ResourceError> {
    let mut sum = ResourceSet::new();
    let mut init_max = ResourceSet::new();
    if let Some(spec) = &pod.spec {
        for container in &spec.containers {
            if let Some(requests) = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
            {
                sum.add(&ResourceSet::from_list(requests)?);
            }
        }
        for container in spec.init_containers.iter().flatten() {
            if let Some(requests) = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
            {
                init_max = init_max.merge_max(&ResourceSet::from_list(requests)?);
            }
        }
        let mut merged = sum.merge_max(&init_max);
        if let Some(overhead) = &spec.overhead {
            merged.add(&ResourceSet::from_list(overhead)?);
        }
        merged.add(&ResourceSet::new().with(RESOURCE_PODS, 1000));
        return Ok(merged);
    }
    sum.add(&ResourceSet::new().with(RESOURCE_PODS, 1000));
    Ok(sum)
}

/// Terminal pods hold no resources and never need rescheduling.
pub fn pod_is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

pub fn pod_is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// DaemonSet pods follow their node; they are never rescheduled by us.
pub fn pod_is_daemonset(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
        .unwrap_or(false)
}

/// Identifies a pod across the codebase. Display form is `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
}

impl PodId {
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for PodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
