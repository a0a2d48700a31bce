//! Per-domain placement counters backing topology spread, pod affinity,
//! and pod anti-affinity.
//!
//! Counters are only mutated when the scheduler commits a placement, so an
//! abandoned attempt needs no rollback.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Pod, PodAffinityTerm, TopologySpreadConstraint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use super::SchedulingError;
use crate::requirements::{Operator, Requirement};

#[derive(Debug, Clone, PartialEq)]
enum GroupKind {
    Spread { max_skew: i32 },
    Affinity,
    AntiAffinity,
}

#[derive(Debug, Clone)]
struct TopologyGroup {
    kind: GroupKind,
    /// The node label whose values are the domains.
    key: String,
    selector: Option<LabelSelector>,
    namespaces: BTreeSet<String>,
    /// Domain → number of placed pods matching `selector`.
    counts: BTreeMap<String, usize>,
    /// AntiAffinity only: domains where a *declaring* pod lives, for the
    /// symmetric check against incoming pods that match the selector.
    owner_counts: BTreeMap<String, usize>,
    identity: String,
}

fn selector_identity(selector: Option<&LabelSelector>) -> String {
    selector
        .and_then(|s| serde_json::to_string(s).ok())
        .unwrap_or_else(|| "null".to_string())
}

fn group_identity(
    kind: &GroupKind,
    key: &str,
    selector: Option<&LabelSelector>,
    namespaces: &BTreeSet<String>,
) -> String {
    format!(
        "{kind:?}|{key}|{}|{namespaces:?}",
        selector_identity(selector)
    )
}

/// Standard label-selector matching (matchLabels + matchExpressions).
pub fn selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> bool {
    let Some(selector) = selector else {
        // An absent selector matches nothing, per the API convention for
        // affinity terms.
        return false;
    };
    for (k, v) in selector.match_labels.iter().flatten() {
        if labels.get(k) != Some(v) {
            return false;
        }
    }
    for expr in selector.match_expressions.iter().flatten() {
        let value = labels.get(&expr.key);
        let values = expr.values.clone().unwrap_or_default();
        let ok = match expr.operator.as_str() {
            "In" => value.map(|v| values.contains(v)).unwrap_or(false),
            "NotIn" => value.map(|v| !values.contains(v)).unwrap_or(true),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        };
        if !ok {
            return false;
        }
    }
    true
}

fn pod_labels(pod: &Pod) -> BTreeMap<String, String> {
    pod.metadata.labels.clone().unwrap_or_default()
}

fn pod_namespace(pod: &Pod) -> String {
    pod.metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string())
}

fn term_namespaces(pod: &Pod, term: &PodAffinityTerm) -> BTreeSet<String> {
    let explicit: BTreeSet<String> = term
        .namespaces
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    if explicit.is_empty() {
        BTreeSet::from([pod_namespace(pod)])
    } else {
        explicit
    }
}

fn spread_constraints(pod: &Pod) -> Vec<TopologySpreadConstraint> {
    pod.spec
        .as_ref()
        .and_then(|s| s.topology_spread_constraints.clone())
        .unwrap_or_default()
}

fn required_affinity_terms(pod: &Pod) -> Vec<PodAffinityTerm> {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.pod_affinity.as_ref())
        .and_then(|a| {
            a.required_during_scheduling_ignored_during_execution
                .clone()
        })
        .unwrap_or_default()
}

fn required_anti_affinity_terms(pod: &Pod) -> Vec<PodAffinityTerm> {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.pod_anti_affinity.as_ref())
        .and_then(|a| {
            a.required_during_scheduling_ignored_during_execution
                .clone()
        })
        .unwrap_or_default()
}

/// The topology tracker for one scheduling run.
pub struct Topology {
    groups: Vec<TopologyGroup>,
    /// Known domain values per topology key: zones from the instance
    /// catalogs, hostnames from live and proposed nodes.
    universe: BTreeMap<String, BTreeSet<String>>,
}

impl Topology {
    pub fn new(universe: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self {
            groups: Vec::new(),
            universe,
        }
    }

    /// A new domain value became possible (e.g. a proposed node's hostname).
    pub fn add_domain(&mut self, key: &str, value: &str) {
        self.universe
            .entry(key.to_string())
            .or_default()
            .insert(value.to_string());
    }

    /// Register the constraint groups a pod declares. Idempotent per
    /// identity; call once per pod in the batch and once per tracked
    /// anti-affinity pod already in the cluster.
    pub fn track_pod_constraints(&mut self, pod: &Pod) {
        let ns = BTreeSet::from([pod_namespace(pod)]);
        for constraint in spread_constraints(pod) {
            if constraint.when_unsatisfiable != "DoNotSchedule" {
                continue;
            }
            self.ensure_group(
                GroupKind::Spread {
                    max_skew: constraint.max_skew,
                },
                &constraint.topology_key,
                constraint.label_selector.as_ref(),
                ns.clone(),
            );
        }
        for term in required_affinity_terms(pod) {
            self.ensure_group(
                GroupKind::Affinity,
                &term.topology_key,
                term.label_selector.as_ref(),
                term_namespaces(pod, &term),
            );
        }
        for term in required_anti_affinity_terms(pod) {
            self.ensure_group(
                GroupKind::AntiAffinity,
                &term.topology_key,
                term.label_selector.as_ref(),
                term_namespaces(pod, &term),
            );
        }
    }

    fn ensure_group(
        &mut self,
        kind: GroupKind,
        key: &str,
        selector: Option<&LabelSelector>,
        namespaces: BTreeSet<String>,
    ) {
        let identity = group_identity(&kind, key, selector, &namespaces);
        if self.groups.iter().any(|g| g.identity == identity) {
            return;
        }
        self.groups.push(TopologyGroup {
            kind,
            key: key.to_string(),
            selector: selector.cloned(),
            namespaces,
            counts: BTreeMap::new(),
            owner_counts: BTreeMap::new(),
            identity,
        });
    }

    /// Count an already-placed pod into every group it participates in.
    pub fn record(&mut self, pod: &Pod, node_labels: &BTreeMap<String, String>) {
        let labels = pod_labels(pod);
        let ns = pod_namespace(pod);
        let declared = declared_identities(pod);
        for group in &mut self.groups {
            let Some(domain) = node_labels.get(&group.key) else {
                continue;
            };
            if group.namespaces.contains(&ns)
                && selector_matches(group.selector.as_ref(), &labels)
            {
                *group.counts.entry(domain.clone()).or_insert(0) += 1;
            }
            if matches!(group.kind, GroupKind::AntiAffinity)
                && declared.contains(&group.identity)
            {
                *group.owner_counts.entry(domain.clone()).or_insert(0) += 1;
            }
        }
    }

    /// The domain constraints a pod must satisfy right now, one
    /// [`Requirement`] per topology key involved.
    pub fn constraints_for(&self, pod: &Pod) -> Result<Vec<Requirement>, SchedulingError> {
        let labels = pod_labels(pod);
        let ns = pod_namespace(pod);
        let declared = declared_identities(pod);
        let mut out = Vec::new();

        for group in &self.groups {
            let is_declarer = declared.contains(&group.identity);
            match &group.kind {
                GroupKind::Spread { max_skew } => {
                    if !is_declarer {
                        continue;
                    }
                    let domains = self.universe.get(&group.key).cloned().unwrap_or_default();
                    if domains.is_empty() {
                        return Err(SchedulingError::Topology(group.key.clone()));
                    }
                    let global_min = domains
                        .iter()
                        .map(|d| group.counts.get(d).copied().unwrap_or(0))
                        .min()
                        .unwrap_or(0);
                    let allowed: Vec<String> = domains
                        .iter()
                        .filter(|d| {
                            let count = group.counts.get(*d).copied().unwrap_or(0);
                            count as i64 <= global_min as i64 + *max_skew as i64 - 1
                        })
                        .cloned()
                        .collect();
                    if allowed.is_empty() {
                        return Err(SchedulingError::Topology(group.key.clone()));
                    }
                    out.push(Requirement::in_values(&group.key, allowed));
                }
                GroupKind::Affinity => {
                    if !is_declarer {
                        continue;
                    }
                    let populated: Vec<String> = group
                        .counts
                        .iter()
                        .filter(|(_, c)| **c > 0)
                        .map(|(d, _)| d.clone())
                        .collect();
                    if populated.is_empty() {
                        // No matching pod exists anywhere yet. If this pod
                        // would satisfy its own affinity, let it land first
                        // and anchor the group.
                        if group.namespaces.contains(&ns)
                            && selector_matches(group.selector.as_ref(), &labels)
                        {
                            continue;
                        }
                        return Err(SchedulingError::Topology(group.key.clone()));
                    }
                    out.push(Requirement::in_values(&group.key, populated));
                }
                GroupKind::AntiAffinity => {
                    // Declarer avoids domains holding matching pods.
                    if is_declarer {
                        let forbidden: Vec<String> = group
                            .counts
                            .iter()
                            .filter(|(_, c)| **c > 0)
                            .map(|(d, _)| d.clone())
                            .collect();
                        if !forbidden.is_empty() {
                            out.push(
                                Requirement::new(&group.key, Operator::NotIn, forbidden)
                                    .map_err(SchedulingError::Requirements)?,
                            );
                        }
                    }
                    // Symmetric direction: a pod matching the selector must
                    // avoid the declarers' domains.
                    if group.namespaces.contains(&ns)
                        && selector_matches(group.selector.as_ref(), &labels)
                    {
                        let forbidden: Vec<String> = group
                            .owner_counts
                            .iter()
                            .filter(|(_, c)| **c > 0)
                            .map(|(d, _)| d.clone())
                            .collect();
                        if !forbidden.is_empty() {
                            out.push(
                                Requirement::new(&group.key, Operator::NotIn, forbidden)
                                    .map_err(SchedulingError::Requirements)?,
                            );
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Pick the domain to pin a proposed node to: the allowed domain with
    /// the fewest placements for the key's busiest group, lexically first
    /// on ties. Deterministic.
    pub fn pin_domain(&self, key: &str, allowed: &Requirement) -> Option<String> {
        let domains = self.universe.get(key)?;
        let mut best: Option<(usize, &String)> = None;
        for domain in domains {
            if !allowed.has(domain) {
                continue;
            }
            let count: usize = self
                .groups
                .iter()
                .filter(|g| g.key == key)
                .map(|g| g.counts.get(domain).copied().unwrap_or(0))
                .sum();
            let better = match best {
                None => true,
                Some((best_count, best_domain)) => {
                    count < best_count || (count == best_count && domain < best_domain)
                }
            };
            if better {
                best = Some((count, domain));
            }
        }
        best.map(|(_, d)| d.clone())
    }
}

/// Identities of the groups a pod declares through its own constraints.
fn declared_identities(pod: &Pod) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let ns = BTreeSet::from([pod_namespace(pod)]);
    for constraint in spread_constraints(pod) {
        if constraint.when_unsatisfiable != "DoNotSchedule" {
            continue;
        }
        out.insert(group_identity(
            &GroupKind::Spread {
                max_skew: constraint.max_skew,
            },
            &constraint.topology_key,
            constraint.label_selector.as_ref(),
            &ns,
        ));
    }
    for term in required_affinity_terms(pod) {
        out.insert(group_identity(
            &GroupKind::Affinity,
            &term.topology_key,
            term.label_selector.as_ref(),
            &term_namespaces(pod, &term),
        ));
    }
    for term in required_anti_affinity_terms(pod) {
        out.insert(group_identity(
            &GroupKind::AntiAffinity,
            &term.topology_key,
            term.label_selector.as_ref(),
            &term_namespaces(pod, &term),
        ));
    }
    out
}
