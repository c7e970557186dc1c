//! Resource quotas — monotonic usage counters compared against ceilings
//!
//! Unlike the token buckets, a quota check never consumes or rolls back
//! anything: usage only grows (until the window is reset) and the check is a
//! plain comparison.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{GateError, Result};

/// Accumulated usage of one scope (function or tenant)
#[derive(Debug, Default)]
pub struct QuotaUsage {
    compute_us: AtomicU64,
    bytes_out: AtomicU64,
}

impl QuotaUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one finished call
    pub fn add(&self, compute_us: u64, bytes_out: u64) {
        self.compute_us.fetch_add(compute_us, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    /// Start a new usage window
    pub fn reset(&self) {
        self.compute_us.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
    }

    pub fn compute_us(&self) -> u64 {
        self.compute_us.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

/// Ceilings for one scope; 0 disables a ceiling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    pub compute_secs: u64,
    pub bytes_out: u64,
}

impl QuotaLimits {
    pub fn new(compute_secs: u64, bytes_out: u64) -> Self {
        Self {
            compute_secs,
            bytes_out,
        }
    }

    /// Compare usage against the ceilings
    pub fn check(&self, scope: &str, usage: &QuotaUsage) -> Result<()> {
        if self.compute_secs > 0 && usage.compute_us() >= self.compute_secs * 1_000_000 {
            return Err(GateError::ResourceExhausted(format!(
                "{} compute time quota ({}s) exhausted",
                scope, self.compute_secs
            )));
        }
        if self.bytes_out > 0 && usage.bytes_out() >= self.bytes_out {
            return Err(GateError::ResourceExhausted(format!(
                "{} transfer quota ({} bytes) exhausted",
                scope, self.bytes_out
            )));
        }
        Ok(())
    }
}
