//! Set-valued label constraints and their algebra.
//!
//! A [`Requirement`] is the normalized form of a node-selector expression:
//! either a finite allow-set or the complement of a deny-set, with optional
//! integer bounds. Composition is always by intersection, which is what
//! lets the scheduler tighten a proposed node as pods are added and reject
//! the addition when the constraints become unsatisfiable.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{NodeSelectorRequirement, NodeSelectorTerm};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

impl Operator {
    pub fn parse(s: &str) -> Result<Self, RequirementsError> {
        match s {
            "In" => Ok(Self::In),
            "NotIn" => Ok(Self::NotIn),
            "Exists" => Ok(Self::Exists),
            "DoesNotExist" => Ok(Self::DoesNotExist),
            "Gt" => Ok(Self::Gt),
            "Lt" => Ok(Self::Lt),
            other => Err(RequirementsError::InvalidOperator(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "In",
            Self::NotIn => "NotIn",
            Self::Exists => "Exists",
            Self::DoesNotExist => "DoesNotExist",
            Self::Gt => "Gt",
            Self::Lt => "Lt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequirementsError {
    #[error("incompatible requirements for label {key}")]
    Incompatible { key: String },

    #[error("requirement for {key} would drop below {required} allowed values")]
    MinValues { key: String, required: u32 },

    #[error("invalid node selector operator {0:?}")]
    InvalidOperator(String),

    #[error("operator {op} on {key} requires exactly one integer value")]
    InvalidBound { key: String, op: &'static str },
}

/// A single keyed constraint in normalized form.
///
/// `complement == false`: the value must be in `values`.
/// `complement == true`: the value must NOT be in `values` (so an empty set
/// with `complement` means Exists). `Gt`/`Lt` live in the bounds and always
/// imply existence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    complement: bool,
    values: BTreeSet<String>,
    greater_than: Option<i64>,
    less_than: Option<i64>,
    pub min_values: Option<u32>,
}

impl Requirement {
    pub fn new<I, S>(key: &str, op: Operator, values: I) -> Result<Self, RequirementsError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        let mut requirement = Self {
            key: key.to_string(),
            complement: false,
            values: BTreeSet::new(),
            greater_than: None,
            less_than: None,
            min_values: None,
        };
        match op {
            Operator::In => requirement.values = values,
            Operator::NotIn => {
                requirement.complement = true;
                requirement.values = values;
            }
            Operator::Exists => requirement.complement = true,
            Operator::DoesNotExist => {}
            Operator::Gt => {
                requirement.complement = true;
                requirement.greater_than = Some(Self::single_bound(key, op, &values)?);
            }
            Operator::Lt => {
                requirement.complement = true;
                requirement.less_than = Some(Self::single_bound(key, op, &values)?);
            }
        }
        Ok(requirement)
    }

    fn single_bound(
        key: &str,
        op: Operator,
        values: &BTreeSet<String>,
    ) -> Result<i64, RequirementsError> {
        if values.len() != 1 {
            return Err(RequirementsError::InvalidBound {
                key: key.to_string(),
                op: op.as_str(),
            });
        }
        values
            .iter()
            .next()
            .unwrap()
            .parse()
            .map_err(|_| RequirementsError::InvalidBound {
                key: key.to_string(),
                op: op.as_str(),
            })
    }

    pub fn exists(key: &str) -> Self {
        Self::new::<[String; 0], String>(key, Operator::Exists, []).unwrap()
    }

    pub fn does_not_exist(key: &str) -> Self {
        Self::new::<[String; 0], String>(key, Operator::DoesNotExist, []).unwrap()
    }

    pub fn in_values<I, S>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(key, Operator::In, values).unwrap()
    }

    pub fn with_min_values(mut self, min_values: u32) -> Self {
        self.min_values = Some(min_values);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operator(&self) -> Operator {
        if self.greater_than.is_some() && self.less_than.is_none() && self.values.is_empty() {
            Operator::Gt
        } else if self.less_than.is_some() && self.greater_than.is_none() && self.values.is_empty()
        {
            Operator::Lt
        } else if self.complement {
            if self.values.is_empty() {
                Operator::Exists
            } else {
                Operator::NotIn
            }
        } else if self.values.is_empty() {
            Operator::DoesNotExist
        } else {
            Operator::In
        }
    }

    fn within_bounds(&self, value: &str) -> bool {
        if self.greater_than.is_none() && self.less_than.is_none() {
            return true;
        }
        let Ok(n) = value.parse::<i64>() else {
            return false;
        };
        self.greater_than.map(|b| n > b).unwrap_or(true)
            && self.less_than.map(|b| n < b).unwrap_or(true)
    }

    pub fn has(&self, value: &str) -> bool {
        if !self.within_bounds(value) {
            return false;
        }
        if self.complement {
            !self.values.contains(value)
        } else {
            self.values.contains(value)
        }
    }

    /// Number of allowed values; `usize::MAX` stands in for an infinite
    /// complement domain.
    pub fn len(&self) -> usize {
        if self.complement {
            usize::MAX
        } else {
            self.values.iter().filter(|v| self.within_bounds(v)).count()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The finite allowed values, sorted. Empty for complement-form
    /// requirements.
    pub fn values(&self) -> Vec<String> {
        if self.complement {
            return vec![];
        }
        self.values
            .iter()
            .filter(|v| self.within_bounds(v))
            .cloned()
            .collect()
    }

    pub fn any(&self) -> Option<String> {
        self.values().into_iter().next()
    }

    /// The deny-set of a NotIn requirement; empty for every other form.
    pub fn denied_values(&self) -> Vec<String> {
        if self.operator() == Operator::NotIn {
            self.values.iter().cloned().collect()
        } else {
            vec![]
        }
    }

    /// The integer bound of a Gt/Lt requirement.
    pub fn bound(&self) -> Option<i64> {
        match self.operator() {
            Operator::Gt => self.greater_than,
            Operator::Lt => self.less_than,
            _ => None,
        }
    }

    fn is_absent_ok(&self) -> bool {
        // NotIn and DoesNotExist are satisfied by a missing label.
        matches!(self.operator(), Operator::NotIn | Operator::DoesNotExist)
    }

    /// Intersect two requirements for the same key.
    pub fn intersection(&self, other: &Requirement) -> Requirement {
        debug_assert_eq!(self.key, other.key);
        let greater_than = match (self.greater_than, other.greater_than) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let less_than = match (self.less_than, other.less_than) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let (complement, values) = match (self.complement, other.complement) {
            (true, true) => (true, self.values.union(&other.values).cloned().collect()),
            (true, false) => (
                false,
                other.values.difference(&self.values).cloned().collect(),
            ),
            (false, true) => (
                false,
                self.values.difference(&other.values).cloned().collect(),
            ),
            (false, false) => (
                false,
                self.values.intersection(&other.values).cloned().collect(),
            ),
        };
        let mut out = Requirement {
            key: self.key.clone(),
            complement,
            values,
            greater_than,
            less_than,
            min_values: match (self.min_values, other.min_values) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        };
        if !out.complement {
            out.values = out
                .values
                .iter()
                .filter(|v| out.within_bounds(v))
                .cloned()
                .collect();
            out.greater_than = None;
            out.less_than = None;
        }
        out
    }

    /// Whether any label value can satisfy this requirement.
    fn is_satisfiable(&self) -> bool {
        if self.complement {
            if let (Some(gt), Some(lt)) = (self.greater_than, self.less_than) {
                return gt + 1 < lt;
            }
            return true;
        }
        self.len() > 0
    }
}

/// A conjunction of requirements keyed by label, composed by intersection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requirements(BTreeMap<String, Requirement>);

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_requirements<I: IntoIterator<Item = Requirement>>(
        reqs: I,
    ) -> Result<Self, RequirementsError> {
        let mut out = Self::new();
        for req in reqs {
            out.add(req)?;
        }
        Ok(out)
    }

    /// Every label becomes a single-valued In requirement.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self(
            labels
                .iter()
                .map(|(k, v)| (k.clone(), Requirement::in_values(k, [v.clone()])))
                .collect(),
        )
    }

    pub fn from_node_selector_term(term: &NodeSelectorTerm) -> Result<Self, RequirementsError> {
        let mut out = Self::new();
        for expr in term.match_expressions.iter().flatten() {
            out.add(requirement_from_selector(expr)?)?;
        }
        Ok(out)
    }

    /// Add a requirement, intersecting with any existing one for the key.
    pub fn add(&mut self, req: Requirement) -> Result<(), RequirementsError> {
        self.add_with(req, true)
    }

    fn add_with(&mut self, req: Requirement, enforce_min_values: bool) -> Result<(), RequirementsError> {
        let key = req.key().to_string();
        let merged = match self.0.get(&key) {
            Some(existing) => {
                let both_absent_ok = existing.is_absent_ok() && req.is_absent_ok();
                let merged = existing.intersection(&req);
                if !merged.is_satisfiable() && !both_absent_ok {
                    return Err(RequirementsError::Incompatible { key });
                }
                if enforce_min_values
                    && let Some(required) = merged.min_values
                    && merged.len() < required as usize
                {
                    return Err(RequirementsError::MinValues { key, required });
                }
                merged
            }
            None => req,
        };
        self.0.insert(key, merged);
        Ok(())
    }

    pub fn intersect(&self, other: &Requirements) -> Result<Requirements, RequirementsError> {
        let mut out = self.clone();
        for req in other.0.values() {
            out.add(req.clone())?;
        }
        Ok(out)
    }

    pub fn compatible(&self, other: &Requirements) -> bool {
        self.intersect(other).is_ok()
    }

    /// Compatibility against a single concrete option (one instance type,
    /// one offering). minValues constrains the aggregate option set, never
    /// an individual member, so it is not enforced here.
    pub fn compatible_with_option(&self, option: &Requirements) -> bool {
        let mut out = self.clone();
        for req in option.0.values() {
            if out.add_with(req.clone(), false).is_err() {
                return false;
            }
        }
        true
    }

    /// Strict satisfaction against a concrete label set: requirements on
    /// absent keys fail unless absence satisfies them (NotIn/DoesNotExist).
    pub fn satisfied_by_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.values().all(|req| match labels.get(req.key()) {
            Some(value) => req.has(value),
            None => req.is_absent_ok(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys resolved to exactly one value become labels on a proposed node.
    pub fn resolved_labels(&self) -> BTreeMap<String, String> {
        self.0
            .values()
            .filter(|r| r.operator() == Operator::In && r.len() == 1)
            .map(|r| (r.key().to_string(), r.any().unwrap()))
            .collect()
    }
}

pub fn requirement_from_selector(
    expr: &NodeSelectorRequirement,
) -> Result<Requirement, RequirementsError> {
    let op = Operator::parse(&expr.operator)?;
    let values = expr.values.clone().unwrap_or_default();
    Ok(Requirement::new(&expr.key, op, values)?)
}
