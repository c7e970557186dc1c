//! Live-tunable settings
//!
//! The values read on hot paths (replica ceiling, autoscaler intervals,
//! default limits) live in atomics so they can be changed at runtime through
//! the admin API or a config-file reload without restarting the gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::GateConfig;
use crate::error::{GateError, Result};

/// Hot-reloadable settings registry
#[derive(Debug)]
pub struct Settings {
    fn_replicas_limit: AtomicU64,
    scale_relax_ms: AtomicU64,
    scale_step_ms: AtomicU64,
    scale_target_concurrency: AtomicU64,
    fn_timeout_max_sec: AtomicU64,
    fn_memory_max_mb: AtomicU64,
    runner_timeout_sec: AtomicU64,
    stats_flush_sec: AtomicU64,
    tryrun_rate: AtomicU64,
    global_rate: AtomicU64,
    global_burst: AtomicU64,
    tenant_rate: AtomicU64,
    tenant_burst: AtomicU64,
    fn_rate: AtomicU64,
    fn_burst: AtomicU64,
    quota_compute_sec: AtomicU64,
    quota_bytes_out: AtomicU64,
    fn_quota_compute_sec: AtomicU64,
    fn_quota_bytes_out: AtomicU64,
}

/// Every tunable name, in display order
pub const SETTING_NAMES: &[&str] = &[
    "fn_replicas_limit",
    "scale_relax_ms",
    "scale_step_ms",
    "scale_target_concurrency",
    "fn_timeout_max_sec",
    "fn_memory_max_mb",
    "runner_timeout_sec",
    "stats_flush_sec",
    "tryrun_rate",
    "global_rate",
    "global_burst",
    "tenant_rate",
    "tenant_burst",
    "fn_rate",
    "fn_burst",
    "quota_compute_sec",
    "quota_bytes_out",
    "fn_quota_compute_sec",
    "fn_quota_bytes_out",
];

impl Settings {
    /// Build the registry from a validated configuration
    pub fn from_config(config: &GateConfig) -> Self {
        let settings = Self {
            fn_replicas_limit: AtomicU64::new(0),
            scale_relax_ms: AtomicU64::new(0),
            scale_step_ms: AtomicU64::new(0),
            scale_target_concurrency: AtomicU64::new(0),
            fn_timeout_max_sec: AtomicU64::new(0),
            fn_memory_max_mb: AtomicU64::new(0),
            runner_timeout_sec: AtomicU64::new(0),
            stats_flush_sec: AtomicU64::new(0),
            tryrun_rate: AtomicU64::new(0),
            global_rate: AtomicU64::new(0),
            global_burst: AtomicU64::new(0),
            tenant_rate: AtomicU64::new(0),
            tenant_burst: AtomicU64::new(0),
            fn_rate: AtomicU64::new(0),
            fn_burst: AtomicU64::new(0),
            quota_compute_sec: AtomicU64::new(0),
            quota_bytes_out: AtomicU64::new(0),
            fn_quota_compute_sec: AtomicU64::new(0),
            fn_quota_bytes_out: AtomicU64::new(0),
        };
        settings.apply(config);
        settings
    }

    /// Overwrite every tunable from a (re)loaded configuration
    pub fn apply(&self, config: &GateConfig) {
        let store = |a: &AtomicU64, v: u64| a.store(v, Ordering::Relaxed);
        store(&self.fn_replicas_limit, config.runtime.max_replicas as u64);
        store(&self.scale_relax_ms, config.scaling.relax_secs * 1000);
        store(&self.scale_step_ms, config.scaling.step_secs * 1000);
        store(
            &self.scale_target_concurrency,
            config.scaling.target_concurrency as u64,
        );
        store(&self.fn_timeout_max_sec, config.runtime.timeout.max);
        store(&self.fn_memory_max_mb, config.runtime.memory.max);
        store(&self.runner_timeout_sec, config.runner.timeout_secs);
        store(&self.stats_flush_sec, config.stats.flush_period_secs);
        store(&self.tryrun_rate, config.limits.tryrun_rate as u64);
        store(&self.global_rate, config.limits.global.rate as u64);
        store(&self.global_burst, config.limits.global.effective_burst() as u64);
        store(&self.tenant_rate, config.limits.tenant.rate as u64);
        store(&self.tenant_burst, config.limits.tenant.effective_burst() as u64);
        store(&self.fn_rate, config.limits.function.rate as u64);
        store(&self.fn_burst, config.limits.function.effective_burst() as u64);
        store(&self.quota_compute_sec, config.limits.quota.compute_secs);
        store(&self.quota_bytes_out, config.limits.quota.bytes_out);
        store(
            &self.fn_quota_compute_sec,
            config.limits.quota.function_compute_secs,
        );
        store(&self.fn_quota_bytes_out, config.limits.quota.function_bytes_out);
    }

    fn slot(&self, name: &str) -> Option<&AtomicU64> {
        let slot = match name {
            "fn_replicas_limit" => &self.fn_replicas_limit,
            "scale_relax_ms" => &self.scale_relax_ms,
            "scale_step_ms" => &self.scale_step_ms,
            "scale_target_concurrency" => &self.scale_target_concurrency,
            "fn_timeout_max_sec" => &self.fn_timeout_max_sec,
            "fn_memory_max_mb" => &self.fn_memory_max_mb,
            "runner_timeout_sec" => &self.runner_timeout_sec,
            "stats_flush_sec" => &self.stats_flush_sec,
            "tryrun_rate" => &self.tryrun_rate,
            "global_rate" => &self.global_rate,
            "global_burst" => &self.global_burst,
            "tenant_rate" => &self.tenant_rate,
            "tenant_burst" => &self.tenant_burst,
            "fn_rate" => &self.fn_rate,
            "fn_burst" => &self.fn_burst,
            "quota_compute_sec" => &self.quota_compute_sec,
            "quota_bytes_out" => &self.quota_bytes_out,
            "fn_quota_compute_sec" => &self.fn_quota_compute_sec,
            "fn_quota_bytes_out" => &self.fn_quota_bytes_out,
            _ => return None,
        };
        Some(slot)
    }

    /// Read a tunable by name
    pub fn get(&self, name: &str) -> Option<u64> {
        self.slot(name).map(|a| a.load(Ordering::Relaxed))
    }

    /// Set a tunable by name
    pub fn set(&self, name: &str, value: u64) -> Result<()> {
        let slot = self
            .slot(name)
            .ok_or_else(|| GateError::NotFound(format!("setting '{}'", name)))?;
        let must_be_positive = matches!(
            name,
            "fn_replicas_limit"
                | "scale_relax_ms"
                | "scale_step_ms"
                | "scale_target_concurrency"
                | "runner_timeout_sec"
                | "stats_flush_sec"
                | "tryrun_rate"
        );
        if must_be_positive && value == 0 {
            return Err(GateError::Config(format!("{} must be greater than 0", name)));
        }
        slot.store(value, Ordering::Relaxed);
        tracing::info!(setting = name, value, "Setting updated");
        Ok(())
    }

    /// Snapshot of every tunable, in display order
    pub fn list(&self) -> Vec<(&'static str, u64)> {
        SETTING_NAMES
            .iter()
            .filter_map(|name| self.get(name).map(|v| (*name, v)))
            .collect()
    }

    pub fn max_replicas(&self) -> u32 {
        self.fn_replicas_limit.load(Ordering::Relaxed) as u32
    }

    pub fn relax_interval(&self) -> Duration {
        Duration::from_millis(self.scale_relax_ms.load(Ordering::Relaxed))
    }

    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.scale_step_ms.load(Ordering::Relaxed))
    }

    pub fn target_concurrency(&self) -> u32 {
        self.scale_target_concurrency.load(Ordering::Relaxed).max(1) as u32
    }

    pub fn timeout_max_secs(&self) -> u64 {
        self.fn_timeout_max_sec.load(Ordering::Relaxed)
    }

    pub fn memory_max_mb(&self) -> u64 {
        self.fn_memory_max_mb.load(Ordering::Relaxed)
    }

    pub fn runner_timeout(&self) -> Duration {
        Duration::from_secs(self.runner_timeout_sec.load(Ordering::Relaxed))
    }

    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.stats_flush_sec.load(Ordering::Relaxed).max(1))
    }

    pub fn tryrun_rate(&self) -> u32 {
        self.tryrun_rate.load(Ordering::Relaxed) as u32
    }

    /// `(rate, burst)` of the global limiter
    pub fn global_limit(&self) -> (u32, u32) {
        (
            self.global_rate.load(Ordering::Relaxed) as u32,
            self.global_burst.load(Ordering::Relaxed) as u32,
        )
    }

    /// `(rate, burst)` applied to new tenants
    pub fn tenant_limit(&self) -> (u32, u32) {
        (
            self.tenant_rate.load(Ordering::Relaxed) as u32,
            self.tenant_burst.load(Ordering::Relaxed) as u32,
        )
    }

    /// `(rate, burst)` applied to functions without their own size limits
    pub fn function_limit(&self) -> (u32, u32) {
        (
            self.fn_rate.load(Ordering::Relaxed) as u32,
            self.fn_burst.load(Ordering::Relaxed) as u32,
        )
    }

    /// `(compute_secs, bytes_out)` ceilings per tenant, 0 = unlimited
    pub fn tenant_quota(&self) -> (u64, u64) {
        (
            self.quota_compute_sec.load(Ordering::Relaxed),
            self.quota_bytes_out.load(Ordering::Relaxed),
        )
    }

    /// `(compute_secs, bytes_out)` ceilings per function, 0 = unlimited
    pub fn function_quota(&self) -> (u64, u64) {
        (
            self.fn_quota_compute_sec.load(Ordering::Relaxed),
            self.fn_quota_bytes_out.load(Ordering::Relaxed),
        )
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&GateConfig::default())
    }
}
