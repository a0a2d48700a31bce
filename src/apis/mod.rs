//! API objects and the wire-visible vocabulary: CRDs, well-known labels,
//! annotations, the disruption taint, and the termination finalizer.

pub mod nodeclaim;
pub mod nodepool;

use k8s_openapi::api::core::v1::Taint;

/// Labels the core writes onto nodes and claims.
pub const LABEL_NODEPOOL: &str = "canopy.sh/nodepool";
pub const LABEL_CAPACITY_TYPE: &str = "canopy.sh/capacity-type";
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";

/// Pods or nodes carrying this annotation are never disrupted.
pub const ANNOTATION_DO_NOT_DISRUPT: &str = "canopy.sh/do-not-disrupt";

/// Applied while a node is part of an in-flight disruption command.
pub const TAINT_DISRUPTED_KEY: &str = "canopy.sh/disrupted";

/// Stamped on managed Nodes at launch; holds deletion open until the
/// termination controller finishes draining, then removes it.
pub const FINALIZER_TERMINATION: &str = "canopy.sh/termination";

pub const CAPACITY_TYPE_ON_DEMAND: &str = "on-demand";
pub const CAPACITY_TYPE_SPOT: &str = "spot";

pub fn disrupted_taint() -> Taint {
    Taint {
        key: TAINT_DISRUPTED_KEY.to_string(),
        value: Some("disrupting".to_string()),
        effect: "NoSchedule".to_string(),
        time_added: None,
    }
}
