//! Volume topology: the zone constraints a pod inherits from its
//! persistent volume claims, resolved before scheduling begins.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolume, Pod};

use super::SchedulingError;
use crate::requirements::{Requirement, Requirements};
use crate::store::Store;

/// Resolve the requirements a pod's volumes impose on node placement.
///
/// Bound PVCs constrain through their PV's node affinity; unbound PVCs
/// through the storage class's allowed topologies. A missing PVC or
/// storage class makes the pod unschedulable this round.
pub async fn volume_requirements(
    store: &Store,
    pod: &Pod,
) -> Result<Requirements, SchedulingError> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let mut out = Requirements::new();

    for volume in pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .into_iter()
        .flatten()
    {
        let Some(source) = &volume.persistent_volume_claim else {
            continue;
        };
        let pvc = store
            .get_pvc(namespace, &source.claim_name)
            .await
            .map_err(|_| {
                SchedulingError::Volume(format!("claim {} not found", source.claim_name))
            })?;

        let bound_volume = pvc.spec.as_ref().and_then(|s| s.volume_name.clone());
        let constraints = match bound_volume {
            Some(pv_name) => {
                let pv = store.get_pv(&pv_name).await.map_err(|_| {
                    SchedulingError::Volume(format!("volume {pv_name} not found"))
                })?;
                pv_node_affinity(&pv)
            }
            None => {
                let Some(sc_name) = pvc
                    .spec
                    .as_ref()
                    .and_then(|s| s.storage_class_name.clone())
                else {
                    continue;
                };
                let sc = store.get_storage_class(&sc_name).await.map_err(|_| {
                    SchedulingError::Volume(format!("storage class {sc_name} not found"))
                })?;
                storage_class_topologies(&sc)
            }
        };

        for (key, values) in constraints {
            out.add(Requirement::in_values(&key, values))
                .map_err(|_| {
                    SchedulingError::Volume(format!(
                        "conflicting volume topologies for {key}"
                    ))
                })?;
        }
    }
    Ok(out)
}

/// Allowed values per key from the PV's required node affinity. Multiple
/// selector terms are an OR, so their allowed values union per key.
fn pv_node_affinity(pv: &PersistentVolume) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let terms = pv
        .spec
        .as_ref()
        .and_then(|s| s.node_affinity.as_ref())
        .and_then(|a| a.required.as_ref())
        .map(|sel| sel.node_selector_terms.clone())
        .unwrap_or_default();
    for term in terms {
        for expr in term.match_expressions.into_iter().flatten() {
            if expr.operator != "In" {
                continue;
            }
            let entry = out.entry(expr.key).or_default();
            for value in expr.values.unwrap_or_default() {
                if !entry.contains(&value) {
                    entry.push(value);
                }
            }
        }
    }
    out
}

fn storage_class_topologies(
    sc: &k8s_openapi::api::storage::v1::StorageClass,
) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for term in sc.allowed_topologies.iter().flatten() {
        for expr in term.match_label_expressions.iter().flatten() {
            let entry = out.entry(expr.key.clone()).or_default();
            for value in &expr.values {
                if !entry.contains(value) {
                    entry.push(value.clone());
                }
            }
        }
    }
    out
}
