//! Connection balancer — deployment targets per function version
//!
//! The dispatcher reads a link on every call, so links sit behind a read-mostly
//! map and carry their counters in atomics. Refreshes from the orchestrator
//! update a link in place instead of replacing it.

pub mod link;

pub use link::{BalancerLink, Lease};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{GateError, Result};
use crate::registry::{DeploymentKey, FunctionRuntime};
use crate::scaling::orchestrator::Orchestrator;

/// Which deployment of a function a call may use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Serving version first, else any other ready run deployment
    AnyReady,
    /// Exactly this deployment, ready or not at all
    Exact(DeploymentKey),
}

/// Function deployment → link table
pub struct Balancer {
    links: RwLock<HashMap<DeploymentKey, Arc<BalancerLink>>>,
    orchestrator: Arc<dyn Orchestrator>,
}

impl Balancer {
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            orchestrator,
        }
    }

    /// Insert or update the link of a deployment
    pub fn set_link(
        &self,
        key: DeploymentKey,
        address: &str,
        total: u32,
        healthy: u32,
    ) -> Arc<BalancerLink> {
        if let Some(link) = self.links.read().unwrap().get(&key) {
            link.update(Some(address), total, healthy);
            return link.clone();
        }
        let mut links = self.links.write().unwrap();
        let link = links
            .entry(key.clone())
            .or_insert_with(|| Arc::new(BalancerLink::new(key, address, total, healthy)));
        link.update(Some(address), total, healthy);
        link.clone()
    }

    pub fn link(&self, key: &DeploymentKey) -> Option<Arc<BalancerLink>> {
        self.links.read().unwrap().get(key).cloned()
    }

    /// Re-read a deployment from the orchestrator. A deployment the
    /// orchestrator no longer knows loses its link.
    pub async fn refresh(&self, key: &DeploymentKey) -> Result<Option<Arc<BalancerLink>>> {
        let name = key.name();
        let status = match self.orchestrator.status(&name).await {
            Ok(status) => status,
            Err(GateError::NotFound(_)) => {
                self.forget_deployment(key);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let link = match (status.address.as_deref(), self.link(key)) {
            (Some(address), _) => self.set_link(key.clone(), address, status.replicas, status.ready),
            (None, Some(link)) => {
                link.update(None, status.replicas, status.ready);
                link
            }
            // No address assigned yet; nothing to route to
            (None, None) => return Ok(None),
        };
        tracing::debug!(
            deployment = %name,
            address = %link.address(),
            total = link.total(),
            healthy = link.healthy(),
            "Balancer link refreshed"
        );
        Ok(Some(link))
    }

    /// Resolve the link a call would use
    pub fn resolve(&self, rt: &FunctionRuntime, lookup: &Lookup) -> Result<Arc<BalancerLink>> {
        let links = self.links.read().unwrap();
        let found = match lookup {
            Lookup::Exact(key) => links.get(key).filter(|l| l.is_ready()).cloned(),
            Lookup::AnyReady => {
                let serving = rt.run_deployment();
                links
                    .get(&serving)
                    .filter(|l| l.is_ready())
                    .cloned()
                    .or_else(|| {
                        links
                            .values()
                            .filter(|l| {
                                l.key().cookie == rt.cookie() && !l.key().build && l.is_ready()
                            })
                            .max_by_key(|l| l.healthy())
                            .cloned()
                    })
            }
        };
        found.ok_or_else(|| GateError::Unavailable("no pods available".to_string()))
    }

    /// Lease a connection slot on the resolved link
    pub fn lease_connection(&self, rt: &Arc<FunctionRuntime>, lookup: &Lookup) -> Result<Lease> {
        let link = self.resolve(rt, lookup)?;
        Ok(Lease::new(rt.clone(), link))
    }

    /// Lease, refreshing the target from the orchestrator once on a miss
    pub async fn acquire(&self, rt: &Arc<FunctionRuntime>, lookup: &Lookup) -> Result<Lease> {
        match self.lease_connection(rt, lookup) {
            Err(GateError::Unavailable(_)) => {
                let key = match lookup {
                    Lookup::Exact(key) => key.clone(),
                    Lookup::AnyReady => rt.run_deployment(),
                };
                if let Err(e) = self.refresh(&key).await {
                    tracing::warn!(deployment = %key, error = %e, "Balancer refresh failed");
                }
                self.lease_connection(rt, lookup)
            }
            other => other,
        }
    }

    /// Give a lease back
    pub fn release_connection(&self, lease: Lease) {
        drop(lease);
    }

    pub fn forget_deployment(&self, key: &DeploymentKey) -> Option<Arc<BalancerLink>> {
        self.links.write().unwrap().remove(key)
    }

    /// Drop every link of a function
    pub fn forget(&self, cookie: &str) -> Vec<DeploymentKey> {
        let mut links = self.links.write().unwrap();
        let keys: Vec<DeploymentKey> = links
            .keys()
            .filter(|k| k.cookie == cookie)
            .cloned()
            .collect();
        for key in &keys {
            links.remove(key);
        }
        keys
    }

    /// Run deployments of a function other than `keep`
    pub fn stale_deployments(&self, cookie: &str, keep: &DeploymentKey) -> Vec<DeploymentKey> {
        self.links
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.cookie == cookie && !k.build && *k != keep)
            .cloned()
            .collect()
    }

    pub fn links_for(&self, cookie: &str) -> Vec<Arc<BalancerLink>> {
        self.links
            .read()
            .unwrap()
            .values()
            .filter(|l| l.key().cookie == cookie)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
