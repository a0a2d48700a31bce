//! The provisioning scheduler: given a batch of pending pods, existing
//! capacity, and the pool catalog, compute the cheapest set of new nodes
//! and pod placements that satisfies every required constraint.

pub mod existing;
pub mod preferences;
pub mod proposal;
pub mod scheduler;
pub mod topology;
pub mod volume;

use k8s_openapi::api::core::v1::{Pod, Taint};
use thiserror::Error;

use crate::requirements::RequirementsError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulingError {
    /// The node exists but is not yet initialized; usable for disruption
    /// simulation, never for a real placement decision.
    #[error("node is not initialized")]
    UninitializedNode,

    #[error("incompatible requirements: {0}")]
    Requirements(#[from] RequirementsError),

    #[error("did not tolerate taint {0}")]
    UntoleratedTaint(String),

    #[error("volume topology unsatisfiable: {0}")]
    Volume(String),

    #[error("would violate topology constraint on {0}")]
    Topology(String),

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("no instance type satisfies the pod")]
    NoInstanceTypeFits,

    #[error("pool limits exceeded for {0}")]
    PoolLimits(String),

    #[error("all node pools exhausted")]
    PoolsExhausted,
}

/// Standard toleration matching. `ignore_prefer_no_schedule` is the
/// preference-relaxation escape hatch: once set, PreferNoSchedule taints no
/// longer block the pod.
pub fn tolerates_taints(
    pod: &Pod,
    taints: &[Taint],
    ignore_prefer_no_schedule: bool,
) -> Result<(), SchedulingError> {
    let tolerations = pod
        .spec
        .as_ref()
        .and_then(|s| s.tolerations.as_ref())
        .cloned()
        .unwrap_or_default();
    for taint in taints {
        if taint.effect == "PreferNoSchedule" && ignore_prefer_no_schedule {
            continue;
        }
        let tolerated = tolerations.iter().any(|t| {
            let key_ok = t.key.as_deref().map(|k| k == taint.key).unwrap_or(true);
            let effect_ok = t
                .effect
                .as_deref()
                .map(|e| e == taint.effect)
                .unwrap_or(true);
            let value_ok = match t.operator.as_deref() {
                Some("Exists") => true,
                _ => {
                    t.key.is_none()
                        || t.value.as_deref() == taint.value.as_deref()
                        || (t.value.is_none() && taint.value.is_none())
                }
            };
            key_ok && effect_ok && value_ok
        });
        if !tolerated {
            return Err(SchedulingError::UntoleratedTaint(format!(
                "{}={}:{}",
                taint.key,
                taint.value.as_deref().unwrap_or(""),
                taint.effect
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, Toleration};

    fn taint(key: &str, effect: &str) -> Taint {
        Taint {
            key: key.to_string(),
            effect: effect.to_string(),
            value: None,
            time_added: None,
        }
    }

    fn pod_tolerating(key: &str) -> Pod {
        Pod {
            spec: Some(PodSpec {
                tolerations: Some(vec![Toleration {
                    key: Some(key.to_string()),
                    operator: Some("Exists".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn untolerated_taint_blocks() {
        let pod = Pod::default();
        assert!(tolerates_taints(&pod, &[taint("dedicated", "NoSchedule")], false).is_err());
        assert!(
            tolerates_taints(&pod_tolerating("dedicated"), &[taint("dedicated", "NoSchedule")], false)
                .is_ok()
        );
    }

    #[test]
    fn prefer_no_schedule_relaxable() {
        let pod = Pod::default();
        let taints = [taint("flaky", "PreferNoSchedule")];
        assert!(tolerates_taints(&pod, &taints, false).is_err());
        assert!(tolerates_taints(&pod, &taints, true).is_ok());
    }

    #[test]
    fn empty_key_exists_tolerates_everything() {
        let pod = Pod {
            spec: Some(PodSpec {
                tolerations: Some(vec![Toleration {
                    operator: Some("Exists".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(tolerates_taints(&pod, &[taint("anything", "NoExecute")], false).is_ok());
    }
}
