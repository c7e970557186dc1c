//! Configuration types for the A3S FaaS gate
//!
//! Uses HCL (HashiCorp Configuration Language) as the configuration format.
//! The hot subset of these values is mirrored into [`Settings`], which can be
//! tuned at runtime without a restart.

mod limits;
mod runtime;
pub mod scaling;
pub mod settings;
mod watcher;

pub use limits::{LimitsConfig, QuotaConfig, RateConfig};
pub use runtime::{LanguageConfig, RangeConfig, RuntimeCatalog, RuntimeConfig, RuntimeInfo};
pub use scaling::ScalingConfig;
pub use settings::Settings;
pub use watcher::{FileWatcher, ReloadEvent};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{GateError, Result};

/// Top-level gate configuration
///
/// # HCL Example
///
/// ```hcl
/// listen = "0.0.0.0:8686"
///
/// runtime {
///   max_replicas = 16
///   languages "python" {
///     build = false
///   }
///   languages "golang" {
///     build     = true
///     build_cmd = ["go", "build", "-o", "function"]
///   }
/// }
///
/// scaling {
///   relax_secs = 30
///   step_secs  = 5
/// }
///
/// limits {
///   tenant {
///     rate  = 100
///     burst = 200
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Listen address for the call path and admin API
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Runtime size ranges and language catalog
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Autoscaler intervals and orchestrator selection
    #[serde(default)]
    pub scaling: ScalingConfig,

    /// Rate and quota limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Runner (watchdog) contract
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Stats flushing
    #[serde(default)]
    pub stats: StatsConfig,

    /// Cross-origin settings for the call path
    #[serde(default)]
    pub cors: CorsConfig,

    /// Identity verification secrets per auth context
    #[serde(default)]
    pub auth: AuthConfig,

    /// Watch the config file and hot-reload settings
    #[serde(default)]
    pub watch: bool,

    /// Graceful shutdown timeout in seconds (default: 30)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8686".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl GateConfig {
    /// Load configuration from an HCL file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GateError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_hcl(&content)
    }

    /// Parse configuration from an HCL string
    pub fn from_hcl(content: &str) -> Result<Self> {
        hcl::from_str(content)
            .map_err(|e| GateError::Config(format!("Failed to parse HCL config: {}", e)))
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        self.listen.parse::<std::net::SocketAddr>().map_err(|e| {
            GateError::Config(format!("Invalid listen address '{}': {}", self.listen, e))
        })?;

        self.runtime.validate()?;
        scaling::validate_scaling(&self.scaling)?;
        self.limits.validate()?;

        if self.runner.timeout_secs == 0 {
            return Err(GateError::Config(
                "runner.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.stats.flush_period_secs == 0 {
            return Err(GateError::Config(
                "stats.flush_period_secs must be greater than 0".to_string(),
            ));
        }
        if self.auth.admin_keys.iter().any(|k| k.is_empty()) {
            return Err(GateError::Config(
                "auth.admin_keys must not contain empty keys".to_string(),
            ));
        }
        for (name, secret) in &self.auth.contexts {
            if secret.is_empty() {
                return Err(GateError::Config(format!(
                    "Auth context '{}' has an empty secret",
                    name
                )));
            }
        }

        Ok(())
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            runtime: RuntimeConfig::default(),
            scaling: ScalingConfig::default(),
            limits: LimitsConfig::default(),
            runner: RunnerConfig::default(),
            stats: StatsConfig::default(),
            cors: CorsConfig::default(),
            auth: AuthConfig::default(),
            watch: false,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Runner (watchdog) contract settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Fixed bound on a single run request (default: 120)
    #[serde(default = "default_runner_timeout")]
    pub timeout_secs: u64,

    /// Port the runner listens on behind the deployment address (default: 8687)
    #[serde(default = "default_runner_port")]
    pub port: u16,

    /// Run endpoint path (default: "/v1/run")
    #[serde(default = "default_runner_path")]
    pub path: String,
}

fn default_runner_timeout() -> u64 {
    120
}

fn default_runner_port() -> u16 {
    8687
}

fn default_runner_path() -> String {
    "/v1/run".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_runner_timeout(),
            port: default_runner_port(),
            path: default_runner_path(),
        }
    }
}

/// Stats recorder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Seconds between flushes of dirty counters (default: 8)
    #[serde(default = "default_flush_period")]
    pub flush_period_secs: u64,
}

fn default_flush_period() -> u64 {
    8
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            flush_period_secs: default_flush_period(),
        }
    }
}

/// Cross-origin settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins (empty = "*")
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Allowed methods (empty = GET, POST, PUT, DELETE, OPTIONS)
    #[serde(default)]
    pub allowed_methods: Vec<String>,

    /// Allowed request headers (empty = Content-Type, Authorization)
    #[serde(default)]
    pub allowed_headers: Vec<String>,

    /// Preflight cache lifetime in seconds (default: 86400)
    #[serde(default)]
    pub max_age: Option<u64>,
}

/// Identity verification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Auth context name → HMAC secret
    #[serde(default)]
    pub contexts: HashMap<String, String>,

    /// Keys accepted on the management API (`X-API-Key`). Empty leaves it open.
    #[serde(default)]
    pub admin_keys: Vec<String>,
}
