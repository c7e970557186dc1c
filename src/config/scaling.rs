//! Scaling configuration — autoscaler intervals and orchestrator selection

use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};

/// Autoscaler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Seconds a reached goal must stay stable before shrinking starts (default: 30)
    #[serde(default = "default_relax")]
    pub relax_secs: u64,

    /// Seconds between single-replica shrink steps (default: 5)
    #[serde(default = "default_step")]
    pub step_secs: u64,

    /// In-flight calls one replica is expected to absorb before growing (default: 1)
    #[serde(default = "default_target_concurrency")]
    pub target_concurrency: u32,

    /// Orchestrator type: "box" (default, HTTP scale API) or "mock"
    #[serde(default = "default_executor")]
    pub executor: String,

    /// Base URL of the orchestrator scale API
    #[serde(default = "default_executor_url")]
    pub url: String,
}

fn default_relax() -> u64 {
    30
}

fn default_step() -> u64 {
    5
}

fn default_target_concurrency() -> u32 {
    1
}

fn default_executor() -> String {
    "box".to_string()
}

fn default_executor_url() -> String {
    "http://127.0.0.1:9090".to_string()
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            relax_secs: default_relax(),
            step_secs: default_step(),
            target_concurrency: default_target_concurrency(),
            executor: default_executor(),
            url: default_executor_url(),
        }
    }
}

/// Validate the scaling block
pub fn validate_scaling(sc: &ScalingConfig) -> Result<()> {
    if sc.relax_secs == 0 {
        return Err(GateError::Config(
            "scaling.relax_secs must be greater than 0".to_string(),
        ));
    }
    if sc.step_secs == 0 {
        return Err(GateError::Config(
            "scaling.step_secs must be greater than 0".to_string(),
        ));
    }
    if sc.step_secs > sc.relax_secs {
        return Err(GateError::Config(format!(
            "scaling.step_secs ({}) must be <= relax_secs ({})",
            sc.step_secs, sc.relax_secs
        )));
    }
    if sc.target_concurrency == 0 {
        return Err(GateError::Config(
            "scaling.target_concurrency must be greater than 0".to_string(),
        ));
    }
    match sc.executor.as_str() {
        "box" | "mock" => Ok(()),
        other => Err(GateError::Config(format!(
            "Unknown scaling executor '{}'",
            other
        ))),
    }
}
