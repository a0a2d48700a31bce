use crate::apis::nodeclaim::NodeClaim;
use crate::apis::nodepool::NodePool;
use crate::providers::fake::FakeCloudProvider;
use crate::providers::kwok::KwokProvider;
use crate::requirements::{Requirement, Requirements};
use crate::resources::ResourceSet;

/// An instance type's purchasable placement: where it runs and what it
/// costs there.
#[derive(Debug, Clone, PartialEq)]
pub struct Offering {
    pub capacity_type: String,
    pub zone: String,
    pub price: f64,
    pub available: bool,
}

impl Offering {
    /// Whether this offering is allowed by the resolved requirements.
    pub fn compatible(&self, requirements: &Requirements) -> bool {
        let zone_ok = requirements
            .get(crate::apis::LABEL_ZONE)
            .map(|r| r.has(&self.zone))
            .unwrap_or(true);
        let capacity_ok = requirements
            .get(crate::apis::LABEL_CAPACITY_TYPE)
            .map(|r| r.has(&self.capacity_type))
            .unwrap_or(true);
        zone_ok && capacity_ok
    }
}

/// Node resources withheld from pods by the kubelet and the system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overhead {
    pub kube_reserved: ResourceSet,
    pub system_reserved: ResourceSet,
    pub eviction_threshold: ResourceSet,
}

/// One purchasable machine shape from a provider's catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceType {
    pub name: String,
    /// Labels this instance type guarantees (instance-type, arch, zones it
    /// can run in, capacity types it is sold under).
    pub requirements: Requirements,
    pub offerings: Vec<Offering>,
    pub capacity: ResourceSet,
    pub overhead: Overhead,
}

impl InstanceType {
    /// `capacity − kubeReserved − systemReserved − evictionThreshold`,
    /// clamped at zero per resource.
    pub fn allocatable(&self) -> ResourceSet {
        self.capacity
            .saturating_sub(&self.overhead.kube_reserved)
            .saturating_sub(&self.overhead.system_reserved)
            .saturating_sub(&self.overhead.eviction_threshold)
    }

    /// Cheapest in-stock offering price consistent with the requirements.
    pub fn cheapest_price(&self, requirements: &Requirements) -> Option<f64> {
        self.offerings
            .iter()
            .filter(|o| o.available && o.compatible(requirements))
            .map(|o| o.price)
            .min_by(|a, b| a.total_cmp(b))
    }

    pub fn has_available_offering(&self, requirements: &Requirements) -> bool {
        self.cheapest_price(requirements).is_some()
    }

    /// The instance type's own requirements extended with its offering
    /// domains, for compatibility checks against pod constraints.
    pub fn full_requirements(&self) -> Requirements {
        let mut out = self.requirements.clone();
        let zones: Vec<String> = self.offerings.iter().map(|o| o.zone.clone()).collect();
        let capacity_types: Vec<String> = self
            .offerings
            .iter()
            .map(|o| o.capacity_type.clone())
            .collect();
        // Offerings are provider data; the merge cannot conflict with the
        // catalog's own requirements.
        let _ = out.add(Requirement::in_values(crate::apis::LABEL_ZONE, zones));
        let _ = out.add(Requirement::in_values(
            crate::apis::LABEL_CAPACITY_TYPE,
            capacity_types,
        ));
        let _ = out.add(Requirement::in_values(
            crate::apis::LABEL_INSTANCE_TYPE,
            [self.name.clone()],
        ));
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No backing instance exists (anymore) for the claim.
    #[error("instance not found for {0}")]
    NotFound(String),

    /// The provider cannot currently satisfy the requested shape.
    /// Not retryable within the same command.
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// Underlying API/network error; retry with backoff.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// The cloud-provider port. One variant per adapter; the core never links
/// against provider SDKs directly.
pub enum CloudProvider {
    Fake(FakeCloudProvider),
    Kwok(KwokProvider),
}

impl CloudProvider {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fake(_) => "fake",
            Self::Kwok(_) => "kwok",
        }
    }

    /// Realize a claim: allocate an instance, returning the claim with
    /// providerID, capacity, and allocatable filled in.
    pub async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim, ProviderError> {
        match self {
            Self::Fake(p) => p.create(claim).await,
            Self::Kwok(p) => p.create(claim).await,
        }
    }

    pub async fn delete(&self, claim: &NodeClaim) -> Result<(), ProviderError> {
        match self {
            Self::Fake(p) => p.delete(claim).await,
            Self::Kwok(p) => p.delete(claim).await,
        }
    }

    pub async fn get(&self, provider_id: &str) -> Result<NodeClaim, ProviderError> {
        match self {
            Self::Fake(p) => p.get(provider_id).await,
            Self::Kwok(p) => p.get(provider_id).await,
        }
    }

    pub async fn list(&self) -> Result<Vec<NodeClaim>, ProviderError> {
        match self {
            Self::Fake(p) => p.list().await,
            Self::Kwok(p) => p.list().await,
        }
    }

    pub async fn instance_types(
        &self,
        pool: &NodePool,
    ) -> Result<Vec<InstanceType>, ProviderError> {
        match self {
            Self::Fake(p) => p.instance_types(pool).await,
            Self::Kwok(p) => p.instance_types(pool).await,
        }
    }

    /// The provider's drift signal: a non-empty reason means the backing
    /// instance no longer matches its template.
    pub async fn is_drifted(&self, claim: &NodeClaim) -> Result<Option<String>, ProviderError> {
        match self {
            Self::Fake(p) => p.is_drifted(claim).await,
            Self::Kwok(p) => p.is_drifted(claim).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance_type() -> InstanceType {
        InstanceType {
            name: "c-2x".to_string(),
            requirements: Requirements::new(),
            offerings: vec![
                Offering {
                    capacity_type: "on-demand".into(),
                    zone: "zone-a".into(),
                    price: 0.10,
                    available: true,
                },
                Offering {
                    capacity_type: "spot".into(),
                    zone: "zone-a".into(),
                    price: 0.03,
                    available: false,
                },
                Offering {
                    capacity_type: "on-demand".into(),
                    zone: "zone-b".into(),
                    price: 0.08,
                    available: true,
                },
            ],
            capacity: ResourceSet::new()
                .with("cpu", 2000)
                .with("memory", 4_000_000)
                .with("pods", 110_000),
            overhead: Overhead {
                kube_reserved: ResourceSet::new().with("cpu", 100).with("memory", 500_000),
                system_reserved: ResourceSet::new().with("cpu", 50),
                eviction_threshold: ResourceSet::new().with("memory", 100_000),
            },
        }
    }

    #[test]
    fn allocatable_subtracts_overhead_and_clamps() {
        let it = instance_type();
        let alloc = it.allocatable();
        assert_eq!(alloc.get("cpu"), 1850);
        assert_eq!(alloc.get("memory"), 3_400_000);

        let mut starved = it.clone();
        starved.overhead.kube_reserved = ResourceSet::new().with("cpu", 99_999_999);
        assert_eq!(starved.allocatable().get("cpu"), 0);
    }

    #[test]
    fn cheapest_price_ignores_unavailable_offerings() {
        let it = instance_type();
        let price = it.cheapest_price(&Requirements::new()).unwrap();
        assert_eq!(price, 0.08);
    }

    #[test]
    fn cheapest_price_respects_zone_requirement() {
        let it = instance_type();
        let reqs = Requirements::from_requirements([Requirement::in_values(
            crate::apis::LABEL_ZONE,
            ["zone-a"],
        )])
        .unwrap();
        assert_eq!(it.cheapest_price(&reqs).unwrap(), 0.10);
    }

    #[test]
    fn full_requirements_exposes_offering_domains() {
        let reqs = instance_type().full_requirements();
        let zones = reqs.get(crate::apis::LABEL_ZONE).unwrap();
        assert!(zones.has("zone-a") && zones.has("zone-b"));
        assert!(
            reqs.get(crate::apis::LABEL_INSTANCE_TYPE)
                .unwrap()
                .has("c-2x")
        );
    }
}
