//! Balancer links and connection leases

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::registry::{DeploymentKey, FunctionRuntime};

/// Resolved target of one function deployment
#[derive(Debug)]
pub struct BalancerLink {
    key: DeploymentKey,
    /// Virtual address in front of the deployment's replicas
    address: RwLock<String>,
    /// Total replica count
    total: AtomicU32,
    /// Replicas passing readiness
    healthy: AtomicU32,
    /// Leases currently held against this link
    leases: AtomicUsize,
}

impl BalancerLink {
    pub fn new(key: DeploymentKey, address: impl Into<String>, total: u32, healthy: u32) -> Self {
        Self {
            key,
            address: RwLock::new(address.into()),
            total: AtomicU32::new(total),
            healthy: AtomicU32::new(healthy),
            leases: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &DeploymentKey {
        &self.key
    }

    pub fn address(&self) -> String {
        self.address.read().unwrap().clone()
    }

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Acquire)
    }

    pub fn healthy(&self) -> u32 {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.healthy() > 0
    }

    pub fn leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    /// Apply a fresh observation from the orchestrator
    pub fn update(&self, address: Option<&str>, total: u32, healthy: u32) {
        if let Some(address) = address {
            let mut current = self.address.write().unwrap();
            if current.as_str() != address {
                *current = address.to_string();
            }
        }
        self.total.store(total, Ordering::Release);
        self.healthy.store(healthy.min(total), Ordering::Release);
    }
}

/// A leased connection slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct Lease {
    runtime: Arc<FunctionRuntime>,
    link: Arc<BalancerLink>,
    address: String,
}

impl Lease {
    pub(crate) fn new(runtime: Arc<FunctionRuntime>, link: Arc<BalancerLink>) -> Self {
        runtime.inc_in_flight();
        link.leases.fetch_add(1, Ordering::AcqRel);
        let address = link.address();
        Self {
            runtime,
            link,
            address,
        }
    }

    /// Address the call must be forwarded to
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn link(&self) -> &Arc<BalancerLink> {
        &self.link
    }

    pub fn runtime(&self) -> &Arc<FunctionRuntime> {
        &self.runtime
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.runtime.dec_in_flight();
        let _ = self
            .link
            .leases
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}
