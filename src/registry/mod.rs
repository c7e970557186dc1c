//! Function registry — durable records plus their lazily built runtimes

pub mod function;
pub mod runtime;
pub mod store;

pub use function::{DeploymentKey, FunctionRecord, FunctionSize, FunctionState, OwnerId};
pub use runtime::{FunctionRuntime, ScalerState, TenantRuntime};
pub use store::{FunctionStore, MemoryFunctionStore};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::admission::QuotaLimits;
use crate::config::{RuntimeCatalog, RuntimeConfig, RuntimeInfo, Settings};
use crate::error::{GateError, Result};
use crate::stats::StatsRecorder;

/// Record store plus the runtime table in front of it
pub struct FunctionRegistry {
    store: Arc<dyn FunctionStore>,
    catalog: RuntimeCatalog,
    ranges: RuntimeConfig,
    settings: Arc<Settings>,
    stats: Arc<StatsRecorder>,
    runtimes: RwLock<HashMap<String, Arc<FunctionRuntime>>>,
    tenants: RwLock<HashMap<String, Arc<TenantRuntime>>>,
}

impl FunctionRegistry {
    pub fn new(
        store: Arc<dyn FunctionStore>,
        runtime: &RuntimeConfig,
        settings: Arc<Settings>,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            store,
            catalog: RuntimeCatalog::from_config(runtime),
            ranges: runtime.clone(),
            settings,
            stats,
            runtimes: RwLock::new(HashMap::new()),
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn FunctionStore> {
        &self.store
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn stats(&self) -> &Arc<StatsRecorder> {
        &self.stats
    }

    /// Runtime capabilities of a language
    pub fn language(&self, lang: &str) -> Result<&RuntimeInfo> {
        self.catalog.get(lang)
    }

    pub fn requires_build(&self, lang: &str) -> bool {
        self.catalog.requires_build(lang)
    }

    /// Runtime of a function, built from the store on first reference
    pub async fn runtime(&self, cookie: &str) -> Result<Arc<FunctionRuntime>> {
        if let Some(rt) = self.loaded(cookie) {
            return Ok(rt);
        }

        let record = self.store.get(cookie).await?;
        let stats = self.stats.track(cookie).await;
        let tenant = self.tenant(&record.id.tenant);
        let rt = Arc::new(FunctionRuntime::new(
            record,
            tenant,
            stats,
            self.settings.function_limit(),
        ));

        // Another caller may have raced us here; first insert wins
        let mut runtimes = self.runtimes.write().unwrap();
        let rt = runtimes.entry(cookie.to_string()).or_insert(rt).clone();
        Ok(rt)
    }

    /// Runtime if already built, without touching the store
    pub fn loaded(&self, cookie: &str) -> Option<Arc<FunctionRuntime>> {
        self.runtimes.read().unwrap().get(cookie).cloned()
    }

    /// Tenant runtime, created with the default tenant limit on first use
    pub fn tenant(&self, tenant: &str) -> Arc<TenantRuntime> {
        if let Some(t) = self.tenants.read().unwrap().get(tenant) {
            return t.clone();
        }
        let (rate, burst) = self.settings.tenant_limit();
        self.tenants
            .write()
            .unwrap()
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(TenantRuntime::new(tenant, rate, burst)))
            .clone()
    }

    /// Push a changed record into its runtime, if one is loaded
    pub fn sync(&self, record: &FunctionRecord) {
        if let Some(rt) = self.loaded(&record.cookie) {
            rt.apply_record(record.clone(), self.settings.function_limit());
        }
    }

    /// Drop a runtime from the table
    pub fn evict(&self, cookie: &str) -> Option<Arc<FunctionRuntime>> {
        self.runtimes.write().unwrap().remove(cookie)
    }

    pub fn loaded_runtimes(&self) -> Vec<Arc<FunctionRuntime>> {
        self.runtimes.read().unwrap().values().cloned().collect()
    }

    /// Re-read default limits from settings into every loaded runtime
    pub fn refresh_limits(&self) {
        let (rate, burst) = self.settings.tenant_limit();
        for tenant in self.tenants.read().unwrap().values() {
            tenant.set_limit(rate, burst);
        }
        let default_limit = self.settings.function_limit();
        for rt in self.loaded_runtimes() {
            rt.apply_record(rt.record(), default_limit);
        }
    }

    /// Start a new quota window for every function and tenant
    pub fn reset_usage(&self) {
        for rt in self.runtimes.read().unwrap().values() {
            rt.usage().reset();
        }
        for tenant in self.tenants.read().unwrap().values() {
            tenant.usage().reset();
        }
        tracing::debug!("Quota usage window reset");
    }

    /// Quota ceilings of a function and of its tenant
    pub fn quota_limits(&self) -> (QuotaLimits, QuotaLimits) {
        let (fc, fb) = self.settings.function_quota();
        let (tc, tb) = self.settings.tenant_quota();
        (QuotaLimits::new(fc, fb), QuotaLimits::new(tc, tb))
    }

    /// Resolve unset sizes to defaults and reject out-of-range ones
    pub fn normalize_size(&self, size: FunctionSize) -> Result<FunctionSize> {
        let mut memory = self.ranges.memory;
        memory.max = memory.max.min(self.settings.memory_max_mb());
        let mut timeout = self.ranges.timeout;
        timeout.max = timeout.max.min(self.settings.timeout_max_secs());

        let memory_mb = memory.resolve("memory", size.memory_mb)?;
        let timeout_ms = if size.timeout_ms == 0 {
            timeout.def * 1000
        } else if size.timeout_ms < timeout.min * 1000 || size.timeout_ms > timeout.max * 1000 {
            return Err(GateError::Config(format!(
                "timeout {}ms is outside [{}s, {}s]",
                size.timeout_ms, timeout.min, timeout.max
            )));
        } else {
            size.timeout_ms
        };

        if size.burst > 0 && size.rate == 0 {
            return Err(GateError::Config("burst requires a rate".to_string()));
        }
        let (global_rate, _) = self.settings.global_limit();
        if global_rate > 0 && size.rate > global_rate {
            return Err(GateError::Config(format!(
                "rate {} exceeds the global rate {}",
                size.rate, global_rate
            )));
        }
        let burst = if size.rate > 0 && size.burst == 0 {
            size.rate
        } else {
            size.burst
        };

        Ok(FunctionSize {
            memory_mb,
            timeout_ms,
            rate: size.rate,
            burst,
        })
    }

    /// Clamp a replica count into `[1, max_replicas]`
    pub fn normalize_replicas(&self, replicas: u32) -> u32 {
        replicas.clamp(1, self.settings.max_replicas().max(1))
    }
}
