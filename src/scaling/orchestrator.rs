//! Orchestrator — the container platform that runs function pods
//!
//! Provides the `Orchestrator` async trait with two implementations:
//! - `BoxOrchestrator` — calls the A3S Box deployment and scale API over HTTP
//! - `MockOrchestrator` — keeps deployments in memory (tests and local runs)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{GateError, Result};
use crate::registry::{DeploymentKey, FunctionSize};

/// Direction of a scaling operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleDirection {
    Up,
    Down,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A scaling request sent to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleDecision {
    /// Deployment being scaled
    pub deployment: String,
    pub direction: ScaleDirection,
    /// Desired replica count
    pub replicas: u32,
    /// Human-readable reason
    pub reason: String,
}

/// Orchestrator answer to a scale request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleResult {
    pub accepted: bool,
    /// Replica count after execution, as reported by the orchestrator
    pub actual_replicas: u32,
    #[serde(default)]
    pub message: String,
}

/// Deployment to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub name: String,
    pub cookie: String,
    pub version: String,
    pub lang: String,
    pub build: bool,
    pub replicas: u32,
    pub memory_mb: u64,
    /// Per-call timeout enforced by the runner
    pub timeout_ms: u64,
}

impl DeploymentSpec {
    pub fn new(key: &DeploymentKey, lang: &str, replicas: u32, size: &FunctionSize) -> Self {
        Self {
            name: key.name(),
            cookie: key.cookie.clone(),
            version: key.version.clone(),
            lang: lang.to_string(),
            build: key.build,
            replicas,
            memory_mb: size.memory_mb,
            timeout_ms: size.timeout_ms,
        }
    }
}

/// Observed state of a deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    /// Total replicas
    pub replicas: u32,
    /// Replicas passing readiness
    pub ready: u32,
    /// Virtual address in front of the replicas, once assigned
    #[serde(default)]
    pub address: Option<String>,
}

/// Async trait for the container orchestrator
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create (or replace) a deployment
    async fn run_deployment(&self, spec: &DeploymentSpec) -> Result<()>;

    /// Delete a deployment; deleting a missing one is not an error
    async fn remove_deployment(&self, deployment: &str) -> Result<()>;

    /// Scale a deployment
    async fn scale(&self, decision: &ScaleDecision) -> Result<ScaleResult>;

    /// Current state of a deployment
    async fn status(&self, deployment: &str) -> Result<DeploymentStatus>;

    /// Orchestrator name (for logging)
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// BoxOrchestrator — calls the A3S Box API over HTTP
// ---------------------------------------------------------------------------

/// Orchestrator backed by the A3S Box API
pub struct BoxOrchestrator {
    /// Base URL of the Box API (e.g., "http://localhost:9090")
    base_url: String,
    client: reqwest::Client,
}

impl BoxOrchestrator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(GateError::Orchestrator(format!(
            "Box API returned {} for {}: {}",
            status, what, body
        )))
    }
}

#[async_trait]
impl Orchestrator for BoxOrchestrator {
    async fn run_deployment(&self, spec: &DeploymentSpec) -> Result<()> {
        let url = format!("{}/v1/deployments", self.base_url);
        let resp = self.client.post(&url).json(spec).send().await.map_err(|e| {
            GateError::Orchestrator(format!(
                "Box deployment request failed for '{}': {}",
                spec.name, e
            ))
        })?;
        Self::check(resp, &spec.name).await?;
        Ok(())
    }

    async fn remove_deployment(&self, deployment: &str) -> Result<()> {
        let url = format!("{}/v1/deployments/{}", self.base_url, deployment);
        let resp = self.client.delete(&url).send().await.map_err(|e| {
            GateError::Orchestrator(format!(
                "Box delete request failed for '{}': {}",
                deployment, e
            ))
        })?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp, deployment).await?;
        Ok(())
    }

    async fn scale(&self, decision: &ScaleDecision) -> Result<ScaleResult> {
        let url = format!("{}/v1/scale/{}", self.base_url, decision.deployment);
        let resp = self
            .client
            .post(&url)
            .json(decision)
            .send()
            .await
            .map_err(|e| {
                GateError::Orchestrator(format!(
                    "Box scale request failed for '{}': {}",
                    decision.deployment, e
                ))
            })?;
        let resp = Self::check(resp, &decision.deployment).await?;

        resp.json::<ScaleResult>().await.map_err(|e| {
            GateError::Orchestrator(format!(
                "Failed to parse Box scale response for '{}': {}",
                decision.deployment, e
            ))
        })
    }

    async fn status(&self, deployment: &str) -> Result<DeploymentStatus> {
        let url = format!("{}/v1/deployments/{}", self.base_url, deployment);
        let resp = self.client.get(&url).send().await.map_err(|e| {
            GateError::Orchestrator(format!(
                "Box status query failed for '{}': {}",
                deployment, e
            ))
        })?;
        let resp = Self::check(resp, deployment).await?;

        resp.json::<DeploymentStatus>().await.map_err(|e| {
            GateError::Orchestrator(format!(
                "Failed to parse deployment status for '{}': {}",
                deployment, e
            ))
        })
    }

    fn name(&self) -> &str {
        "box"
    }
}

// ---------------------------------------------------------------------------
// MockOrchestrator — in-memory deployments
// ---------------------------------------------------------------------------

/// In-memory orchestrator. Deployments become ready as soon as they are
/// scaled, and every deployment shares one configurable address.
pub struct MockOrchestrator {
    deployments: Mutex<HashMap<String, DeploymentSpec>>,
    replicas: Mutex<HashMap<String, u32>>,
    decisions: Mutex<Vec<ScaleDecision>>,
    address: Mutex<String>,
    /// Highest replica count the mock will report, simulating lagging capacity
    capacity: Mutex<Option<u32>>,
    failing: AtomicBool,
    status_delay: Mutex<Option<std::time::Duration>>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self {
            deployments: Mutex::new(HashMap::new()),
            replicas: Mutex::new(HashMap::new()),
            decisions: Mutex::new(Vec::new()),
            address: Mutex::new("127.0.0.1:8687".to_string()),
            capacity: Mutex::new(None),
            failing: AtomicBool::new(false),
            status_delay: Mutex::new(None),
        }
    }

    /// Address reported for every deployment
    pub fn set_address(&self, address: impl Into<String>) {
        *self.address.lock().unwrap() = address.into();
    }

    /// Set the replica count of a deployment directly
    pub fn set_replicas(&self, deployment: &str, count: u32) {
        self.replicas
            .lock()
            .unwrap()
            .insert(deployment.to_string(), count);
    }

    pub fn replicas(&self, deployment: &str) -> u32 {
        *self.replicas.lock().unwrap().get(deployment).unwrap_or(&0)
    }

    /// Cap reported replicas (None = unlimited)
    pub fn set_capacity(&self, capacity: Option<u32>) {
        *self.capacity.lock().unwrap() = capacity;
    }

    /// Make every call fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Answer status queries late, as seen when they were asked
    pub fn set_status_delay(&self, delay: Option<std::time::Duration>) {
        *self.status_delay.lock().unwrap() = delay;
    }

    /// All scale requests, in order
    pub fn decisions(&self) -> Vec<ScaleDecision> {
        self.decisions.lock().unwrap().clone()
    }

    /// Replica counts requested for one deployment, in order
    pub fn history(&self, deployment: &str) -> Vec<u32> {
        self.decisions
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.deployment == deployment)
            .map(|d| d.replicas)
            .collect()
    }

    pub fn has_deployment(&self, deployment: &str) -> bool {
        self.deployments.lock().unwrap().contains_key(deployment)
    }

    pub fn deployment_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.deployments.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GateError::Orchestrator("mock orchestrator unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for MockOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn run_deployment(&self, spec: &DeploymentSpec) -> Result<()> {
        self.check_available()?;
        self.deployments
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec.clone());
        self.set_replicas(&spec.name, spec.replicas);
        Ok(())
    }

    async fn remove_deployment(&self, deployment: &str) -> Result<()> {
        self.check_available()?;
        self.deployments.lock().unwrap().remove(deployment);
        self.replicas.lock().unwrap().remove(deployment);
        Ok(())
    }

    async fn scale(&self, decision: &ScaleDecision) -> Result<ScaleResult> {
        self.check_available()?;
        self.decisions.lock().unwrap().push(decision.clone());

        let actual = match *self.capacity.lock().unwrap() {
            Some(cap) => decision.replicas.min(cap),
            None => decision.replicas,
        };
        self.set_replicas(&decision.deployment, actual);

        Ok(ScaleResult {
            accepted: true,
            actual_replicas: actual,
            message: format!(
                "Mock: scaled '{}' to {} replicas",
                decision.deployment, actual
            ),
        })
    }

    async fn status(&self, deployment: &str) -> Result<DeploymentStatus> {
        self.check_available()?;
        if !self.has_deployment(deployment) {
            return Err(GateError::NotFound(format!("deployment {}", deployment)));
        }
        let replicas = self.replicas(deployment);
        let status = DeploymentStatus {
            replicas,
            ready: replicas,
            address: Some(self.address.lock().unwrap().clone()),
        };
        let delay = *self.status_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(status)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
