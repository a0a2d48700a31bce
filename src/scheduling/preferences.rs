//! Preferential relaxation: when a pod cannot schedule, shed its softest
//! preference and retry. Required constraints are never touched, and the
//! last term of a required OR is never removed.

use k8s_openapi::api::core::v1::Pod;

/// A pod plus the relaxation state the scheduler threads through retries.
pub struct RelaxablePod {
    pub pod: Pod,
    pub ignore_prefer_no_schedule: bool,
}

impl RelaxablePod {
    pub fn new(pod: Pod) -> Self {
        Self {
            pod,
            ignore_prefer_no_schedule: false,
        }
    }
}

/// Drop the single lightest remaining preference. Returns a description of
/// what was relaxed, or None when the pod has nothing left to give up.
pub fn relax(p: &mut RelaxablePod) -> Option<String> {
    if let Some(desc) = relax_lightest_preferred_term(&mut p.pod) {
        return Some(desc);
    }
    if let Some(desc) = relax_required_or_term(&mut p.pod) {
        return Some(desc);
    }
    if !p.ignore_prefer_no_schedule {
        p.ignore_prefer_no_schedule = true;
        return Some("PreferNoSchedule taints".to_string());
    }
    None
}

/// The lightest-weight term across preferred node affinity, pod affinity,
/// and pod anti-affinity.
fn relax_lightest_preferred_term(pod: &mut Pod) -> Option<String> {
    let affinity = pod.spec.as_mut()?.affinity.as_mut()?;

    #[derive(Clone, Copy, PartialEq)]
    enum Kind {
        Node,
        PodAffinity,
        PodAntiAffinity,
    }

    let mut lightest: Option<(i32, Kind, usize)> = None;
    let mut consider = |weight: i32, kind: Kind, index: usize| {
        if lightest.map(|(w, _, _)| weight < w).unwrap_or(true) {
            lightest = Some((weight, kind, index));
        }
    };

    if let Some(node_affinity) = affinity.node_affinity.as_ref() {
        for (i, term) in node_affinity
            .preferred_during_scheduling_ignored_during_execution
            .iter()
            .flatten()
            .enumerate()
        {
            consider(term.weight, Kind::Node, i);
        }
    }
    if let Some(pod_affinity) = affinity.pod_affinity.as_ref() {
        for (i, term) in pod_affinity
            .preferred_during_scheduling_ignored_during_execution
            .iter()
            .flatten()
            .enumerate()
        {
            consider(term.weight, Kind::PodAffinity, i);
        }
    }
    if let Some(anti) = affinity.pod_anti_affinity.as_ref() {
        for (i, term) in anti
            .preferred_during_scheduling_ignored_during_execution
            .iter()
            .flatten()
            .enumerate()
        {
            consider(term.weight, Kind::PodAntiAffinity, i);
        }
    }

    let (weight, kind, index) = lightest?;
    match kind {
        Kind::Node => {
            affinity
                .node_affinity
                .as_mut()?
                .preferred_during_scheduling_ignored_during_execution
                .as_mut()?
                .remove(index);
            Some(format!("preferred node affinity term (weight {weight})"))
        }
        Kind::PodAffinity => {
            affinity
                .pod_affinity
                .as_mut()?
                .preferred_during_scheduling_ignored_during_execution
                .as_mut()?
                .remove(index);
            Some(format!("preferred pod affinity term (weight {weight})"))
        }
        Kind::PodAntiAffinity => {
            affinity
                .pod_anti_affinity
                .as_mut()?
                .preferred_during_scheduling_ignored_during_execution
                .as_mut()?
                .remove(index);
            Some(format!(
                "preferred pod anti-affinity term (weight {weight})"
            ))
        }
    }
}

/// Required node affinity with multiple NodeSelectorTerms is an OR; terms
/// are tried by removal from the front, but the last term is required and
/// never dropped.
fn relax_required_or_term(pod: &mut Pod) -> Option<String> {
    let terms = pod
        .spec
        .as_mut()?
        .affinity
        .as_mut()?
        .node_affinity
        .as_mut()?
        .required_during_scheduling_ignored_during_execution
        .as_mut()
        .map(|sel| &mut sel.node_selector_terms)?;
    if terms.len() > 1 {
        terms.remove(0);
        return Some("alternative required node selector term".to_string());
    }
    None
}
