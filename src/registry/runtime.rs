//! In-memory runtime records
//!
//! A [`FunctionRuntime`] is created lazily the first time a function is
//! referenced and lives until the function is removed. It carries everything
//! the hot call path needs without touching the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;

use super::function::{DeploymentKey, FunctionRecord, FunctionState};
use crate::admission::{QuotaUsage, RateLimiter};
use crate::stats::{FnStats, RunLog};

/// Autoscaler state of one function, guarded by the runtime's scaler lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalerState {
    /// Desired replica count
    pub goal: u32,
    /// Configured replicas; never shrunk below
    pub floor: u32,
    /// Whether a scaling loop currently owns this function
    pub running: bool,
    /// Set once the function is removed; no goal is accepted afterwards
    pub retired: bool,
}

/// Per-tenant runtime: limiter and quota usage
#[derive(Debug)]
pub struct TenantRuntime {
    tenant: String,
    limiter: RwLock<Option<Arc<RateLimiter>>>,
    usage: QuotaUsage,
}

impl TenantRuntime {
    pub fn new(tenant: impl Into<String>, rate: u32, burst: u32) -> Self {
        Self {
            tenant: tenant.into(),
            limiter: RwLock::new(make_limiter(rate, burst)),
            usage: QuotaUsage::new(),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn limiter(&self) -> Option<Arc<RateLimiter>> {
        self.limiter.read().unwrap().clone()
    }

    /// Apply new limits, keeping the bucket when nothing changed
    pub fn set_limit(&self, rate: u32, burst: u32) {
        set_limiter(&self.limiter, rate, burst);
    }

    pub fn usage(&self) -> &QuotaUsage {
        &self.usage
    }
}

/// Per-function runtime record
#[derive(Debug)]
pub struct FunctionRuntime {
    cookie: String,
    tenant: Arc<TenantRuntime>,
    record: RwLock<FunctionRecord>,
    limiter: RwLock<Option<Arc<RateLimiter>>>,
    usage: QuotaUsage,
    in_flight: AtomicU64,
    stats: Arc<FnStats>,
    logs: RunLog,
    /// Autoscaler goal/floor; paired with `wakeup`
    pub(crate) scaler: Mutex<ScalerState>,
    /// Wakes the scaling loop when the goal changes
    pub(crate) wakeup: Notify,
}

impl FunctionRuntime {
    pub fn new(
        record: FunctionRecord,
        tenant: Arc<TenantRuntime>,
        stats: Arc<FnStats>,
        default_limit: (u32, u32),
    ) -> Self {
        let (rate, burst) = function_limit(&record, default_limit);
        Self {
            cookie: record.cookie.clone(),
            tenant,
            limiter: RwLock::new(make_limiter(rate, burst)),
            record: RwLock::new(record),
            usage: QuotaUsage::new(),
            in_flight: AtomicU64::new(0),
            stats,
            logs: RunLog::default(),
            scaler: Mutex::new(ScalerState::default()),
            wakeup: Notify::new(),
        }
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Snapshot of the last known record
    pub fn record(&self) -> FunctionRecord {
        self.record.read().unwrap().clone()
    }

    pub fn state(&self) -> FunctionState {
        self.record.read().unwrap().state
    }

    /// Deployment currently serving calls
    pub fn run_deployment(&self) -> DeploymentKey {
        self.record.read().unwrap().run_deployment()
    }

    /// Refresh the cached record and reconfigure the limiter in place
    pub fn apply_record(&self, record: FunctionRecord, default_limit: (u32, u32)) {
        let (rate, burst) = function_limit(&record, default_limit);
        set_limiter(&self.limiter, rate, burst);
        *self.record.write().unwrap() = record;
    }

    pub fn tenant(&self) -> &Arc<TenantRuntime> {
        &self.tenant
    }

    pub fn limiter(&self) -> Option<Arc<RateLimiter>> {
        self.limiter.read().unwrap().clone()
    }

    pub fn usage(&self) -> &QuotaUsage {
        &self.usage
    }

    pub fn stats(&self) -> &Arc<FnStats> {
        &self.stats
    }

    /// Recent runner output
    pub fn logs(&self) -> &RunLog {
        &self.logs
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn inc_in_flight(&self) -> u64 {
        self.in_flight.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn dec_in_flight(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Current autoscaler state
    pub fn scaler_state(&self) -> ScalerState {
        *self.scaler.lock().unwrap()
    }
}

/// Effective `(rate, burst)` of a function: its own size limits, else the default
fn function_limit(record: &FunctionRecord, default_limit: (u32, u32)) -> (u32, u32) {
    if record.size.rate > 0 {
        (record.size.rate, record.size.burst)
    } else {
        default_limit
    }
}

fn make_limiter(rate: u32, burst: u32) -> Option<Arc<RateLimiter>> {
    if rate == 0 {
        return None;
    }
    let burst = if burst == 0 { rate } else { burst };
    Some(Arc::new(RateLimiter::new(rate, burst)))
}

fn set_limiter(slot: &RwLock<Option<Arc<RateLimiter>>>, rate: u32, burst: u32) {
    let burst = if burst == 0 { rate } else { burst };
    let mut slot = slot.write().unwrap();
    match (slot.as_ref(), rate) {
        (_, 0) => *slot = None,
        (Some(rl), _) if rl.rate() == rate && rl.burst() == burst => {}
        // Reconfigure in place so concurrent holders see the new limits
        (Some(rl), _) => rl.update(rate, burst),
        (None, _) => *slot = make_limiter(rate, burst),
    }
}
