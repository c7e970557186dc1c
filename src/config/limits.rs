//! Rate and quota limit configuration

use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};

/// Token bucket parameters. A rate of 0 disables the limiter for that scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Refill rate in events per second
    #[serde(default)]
    pub rate: u32,

    /// Bucket capacity (default: same as rate)
    #[serde(default)]
    pub burst: u32,
}

impl RateConfig {
    pub fn new(rate: u32, burst: u32) -> Self {
        Self { rate, burst }
    }

    /// Whether this scope is limited at all
    pub fn is_limited(&self) -> bool {
        self.rate > 0
    }

    /// Burst with the "defaults to rate" rule applied
    pub fn effective_burst(&self) -> u32 {
        if self.burst == 0 {
            self.rate
        } else {
            self.burst
        }
    }
}

/// Usage ceilings compared against accumulated counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Accumulated compute seconds per tenant (0 = unlimited)
    #[serde(default)]
    pub compute_secs: u64,

    /// Accumulated response bytes per tenant (0 = unlimited)
    #[serde(default)]
    pub bytes_out: u64,

    /// Accumulated compute seconds per function (0 = unlimited)
    #[serde(default)]
    pub function_compute_secs: u64,

    /// Accumulated response bytes per function (0 = unlimited)
    #[serde(default)]
    pub function_bytes_out: u64,

    /// Usage window; counters reset at every window boundary (0 = never)
    #[serde(default)]
    pub window_secs: u64,
}

/// Limits block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Process-wide limiter (disabled by default)
    #[serde(default)]
    pub global: RateConfig,

    /// Default per-tenant limiter (disabled by default)
    #[serde(default)]
    pub tenant: RateConfig,

    /// Default per-function limiter, used when a function does not set its own
    #[serde(default)]
    pub function: RateConfig,

    /// Try-run calls per second across the gate (default: 1)
    #[serde(default = "default_tryrun_rate")]
    pub tryrun_rate: u32,

    /// Usage quotas
    #[serde(default)]
    pub quota: QuotaConfig,
}

fn default_tryrun_rate() -> u32 {
    1
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global: RateConfig::default(),
            tenant: RateConfig::default(),
            function: RateConfig::default(),
            tryrun_rate: default_tryrun_rate(),
            quota: QuotaConfig::default(),
        }
    }
}

impl LimitsConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        for (scope, rc) in [
            ("global", &self.global),
            ("tenant", &self.tenant),
            ("function", &self.function),
        ] {
            if rc.rate == 0 && rc.burst > 0 {
                return Err(GateError::Config(format!(
                    "limits.{}: burst set without rate",
                    scope
                )));
            }
        }
        if self.tryrun_rate == 0 {
            return Err(GateError::Config(
                "limits.tryrun_rate must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
