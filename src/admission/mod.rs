//! Admission control — layered rate limiting and resource quotas
//!
//! A call is admitted only if the function, tenant and global limiters all
//! grant a token, in that order. When a wider scope rejects, the tokens taken
//! at the tighter scopes are returned (global → tenant → function) so a
//! rejected call never leaks tokens.

pub mod quota;
pub mod rate_limit;

pub use quota::{QuotaLimits, QuotaUsage};
pub use rate_limit::RateLimiter;

use crate::error::{GateError, Result};
use std::sync::{Arc, RwLock};

/// Limiter scope, narrowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Function,
    Tenant,
    Global,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function => write!(f, "function"),
            Self::Tenant => write!(f, "tenant"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// Process-wide admission state: the optional global limiter
pub struct AdmissionControl {
    global: RwLock<Option<Arc<RateLimiter>>>,
}

impl AdmissionControl {
    /// Create admission control; a rate of 0 disables the global limiter
    pub fn new(global_rate: u32, global_burst: u32) -> Self {
        Self {
            global: RwLock::new(make_limiter(global_rate, global_burst)),
        }
    }

    /// Replace the global limiter after a settings change
    pub fn set_global(&self, rate: u32, burst: u32) {
        let burst = if burst == 0 { rate } else { burst };
        let mut global = self.global.write().unwrap();
        match global.as_ref() {
            Some(rl) if rate > 0 && rl.rate() == rate && rl.burst() == burst => {}
            _ => *global = make_limiter(rate, burst),
        }
    }

    pub fn global(&self) -> Option<Arc<RateLimiter>> {
        self.global.read().unwrap().clone()
    }

    /// Run the layered rate-limit check for one call.
    ///
    /// `None` limiters are unlimited scopes.
    pub fn admit(
        &self,
        function: Option<&RateLimiter>,
        tenant: Option<&RateLimiter>,
    ) -> Result<()> {
        let global = self.global();
        admit_scopes(function, tenant, global.as_deref())
    }
}

fn make_limiter(rate: u32, burst: u32) -> Option<Arc<RateLimiter>> {
    if rate == 0 {
        None
    } else {
        let burst = if burst == 0 { rate } else { burst };
        Some(Arc::new(RateLimiter::new(rate, burst)))
    }
}

/// Acquire function → tenant → global, rolling back on the first rejection
pub fn admit_scopes(
    function: Option<&RateLimiter>,
    tenant: Option<&RateLimiter>,
    global: Option<&RateLimiter>,
) -> Result<()> {
    let scopes = [
        (Scope::Function, function),
        (Scope::Tenant, tenant),
        (Scope::Global, global),
    ];
    let mut taken: Vec<&RateLimiter> = Vec::with_capacity(scopes.len());

    for (scope, limiter) in scopes {
        let Some(limiter) = limiter else {
            continue;
        };
        if limiter.acquire() {
            taken.push(limiter);
            continue;
        }

        // Undo in reverse acquisition order
        for held in taken.iter().rev() {
            held.release();
        }
        tracing::debug!(scope = %scope, "Admission rejected");
        return Err(GateError::RateLimited(format!("{} rate limit exceeded", scope)));
    }

    Ok(())
}

/// Quota check for a call: function ceilings first, then tenant ceilings
pub fn check_quota(
    function: (&QuotaUsage, QuotaLimits),
    tenant: (&QuotaUsage, QuotaLimits),
) -> Result<()> {
    function.1.check("function", function.0)?;
    tenant.1.check("tenant", tenant.0)
}
