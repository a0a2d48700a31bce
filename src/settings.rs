//! Operator settings, loaded from the environment once at startup.

use std::time::Duration;

use envconfig::Envconfig;

#[derive(Debug, Clone, Envconfig)]
pub struct Settings {
    /// Quiet period before a provisioning batch is considered complete.
    #[envconfig(from = "CANOPY_BATCH_IDLE_MS", default = "1000")]
    pub batch_idle_ms: u64,

    /// Hard cap on how long a provisioning batch may accumulate.
    #[envconfig(from = "CANOPY_BATCH_MAX_MS", default = "10000")]
    pub batch_max_ms: u64,

    /// Fallback provisioning tick when no pod events arrive.
    #[envconfig(from = "CANOPY_PROVISION_INTERVAL_MS", default = "10000")]
    pub provision_interval_ms: u64,

    /// Delay between computing a disruption command and validating it
    /// against fresh cluster state.
    #[envconfig(from = "CANOPY_VALIDATION_TTL_MS", default = "15000")]
    pub validation_ttl_ms: u64,

    /// Budget for one single-node consolidation scan.
    #[envconfig(from = "CANOPY_CONSOLIDATION_TIMEOUT_MS", default = "180000")]
    pub consolidation_timeout_ms: u64,

    /// Budget for one multi-node consolidation solve.
    #[envconfig(from = "CANOPY_MULTI_CONSOLIDATION_TIMEOUT_MS", default = "60000")]
    pub multi_consolidation_timeout_ms: u64,

    /// Disruption scan cadence.
    #[envconfig(from = "CANOPY_DISRUPTION_INTERVAL_MS", default = "10000")]
    pub disruption_interval_ms: u64,

    /// Concurrent evictions during a drain.
    #[envconfig(from = "CANOPY_DRAIN_CONCURRENCY", default = "5")]
    pub drain_concurrency: usize,

    #[envconfig(from = "CANOPY_HEALTH_ADDR", default = "0.0.0.0:8081")]
    pub health_addr: String,
}

impl Settings {
    pub fn batch_idle(&self) -> Duration {
        Duration::from_millis(self.batch_idle_ms)
    }

    pub fn batch_max(&self) -> Duration {
        Duration::from_millis(self.batch_max_ms)
    }

    pub fn validation_ttl(&self) -> Duration {
        Duration::from_millis(self.validation_ttl_ms)
    }

    pub fn consolidation_timeout(&self) -> Duration {
        Duration::from_millis(self.consolidation_timeout_ms)
    }

    pub fn multi_consolidation_timeout(&self) -> Duration {
        Duration::from_millis(self.multi_consolidation_timeout_ms)
    }
}
