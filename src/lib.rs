//! # A3S FaaS
//!
//! Control plane of a function-as-a-service platform: it tracks functions
//! through their build and deploy states, admits calls through layered rate
//! limits and quotas, balances them over function pods, and scales each
//! function's deployment with its load.
//!
//! ## Architecture
//!
//! ```text
//! /call/{id} → Admission → Balancer (lease) → Runner (pod) → Stats
//!                              ↑
//!           Lifecycle → Orchestrator ← Autoscaler
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use a3s_faas::{Gate, config::GateConfig};
//!
//! #[tokio::main]
//! async fn main() -> a3s_faas::Result<()> {
//!     let config = GateConfig::from_file("gate.hcl").await?;
//!     let gate = Gate::new(config)?;
//!     gate.start().await?;
//!     gate.wait_for_shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod balancer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod observability;
pub mod registry;
pub mod scaling;
pub mod server;
pub mod stats;

pub use error::{GateError, Result};
pub use gate::Gate;

use serde::{Deserialize, Serialize};

/// Gate runtime state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    #[default]
    Created,
    /// Resuming functions and binding the listener
    Starting,
    Running,
    /// Applying a new configuration
    Reloading,
    Stopping,
    Stopped,
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Reloading => write!(f, "reloading"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Gate health snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: GateState,
    pub uptime_secs: u64,
    /// Calls currently forwarded to a runner
    pub active_calls: u64,
    pub total_calls: u64,
    /// Functions with an in-memory runtime
    pub functions_loaded: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_state_display() {
        assert_eq!(GateState::default().to_string(), "created");
        assert_eq!(GateState::Running.to_string(), "running");
        assert_eq!(GateState::Reloading.to_string(), "reloading");
        assert_eq!(GateState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_health_status_serialization() {
        let health = HealthStatus {
            state: GateState::Running,
            uptime_secs: 3600,
            active_calls: 3,
            total_calls: 10_000,
            functions_loaded: 12,
        };
        let json = serde_json::to_string(&health).unwrap();
        let parsed: HealthStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.state, GateState::Running);
        assert_eq!(parsed.total_calls, 10_000);
        assert_eq!(parsed.functions_loaded, 12);
    }
}
