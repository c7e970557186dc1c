//! Function records, owner identity and the lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GateError, Result};

/// Owner identity shared by every record kind: tenant, project and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId {
    pub tenant: String,
    pub project: String,
    pub name: String,
}

impl OwnerId {
    pub fn new(
        tenant: impl Into<String>,
        project: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            project: project.into(),
            name: name.into(),
        }
    }

    /// Stable lookup key derived from the identity alone
    pub fn cookie(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tenant.as_bytes());
        hasher.update(b"/");
        hasher.update(self.project.as_bytes());
        hasher.update(b"/");
        hasher.update(self.name.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Reject empty components and separators that would make cookies ambiguous
    pub fn validate(&self) -> Result<()> {
        for (what, value) in [
            ("tenant", &self.tenant),
            ("project", &self.project),
            ("name", &self.name),
        ] {
            if value.is_empty() {
                return Err(GateError::BadRequest(format!("{} is required", what)));
            }
            if value.contains('/') {
                return Err(GateError::BadRequest(format!(
                    "{} '{}' must not contain '/'",
                    what, value
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.project, self.name)
    }
}

/// Function lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionState {
    /// Run pods requested, not yet confirmed
    Queued,
    /// Build pod running
    Building,
    /// Build finished, run pods starting
    Built,
    /// Serving traffic
    Ready,
    /// Serving traffic while a new build is in flight
    Updating,
    /// Build or update failed; only update and remove are allowed
    Stalled,
    /// Removal in progress
    Terminating,
    /// Manually switched off, reversible
    Deactivated,
}

impl FunctionState {
    /// Initial state on add
    pub fn on_add(requires_build: bool) -> Self {
        if requires_build {
            Self::Building
        } else {
            Self::Queued
        }
    }

    /// State after a source update was accepted
    pub fn on_update(self, requires_build: bool) -> Result<Self> {
        match (self, requires_build) {
            (Self::Ready, true) => Ok(Self::Updating),
            (Self::Ready, false) => Ok(Self::Ready),
            (Self::Stalled, true) => Ok(Self::Building),
            (Self::Stalled, false) => Ok(Self::Queued),
            (state, _) => Err(GateError::InvalidState(format!(
                "cannot update a function in state '{}'",
                state
            ))),
        }
    }

    /// States that may serve calls
    pub fn is_serving(self) -> bool {
        matches!(self, Self::Ready | Self::Updating)
    }

    /// States from which removal is allowed
    pub const REMOVABLE: &'static [FunctionState] = &[Self::Ready, Self::Stalled];

    /// States from which deactivation is allowed
    pub const DEACTIVATABLE: &'static [FunctionState] = &[Self::Ready, Self::Stalled];

    /// State a deactivated function returns to. Only a function that was
    /// serving comes back `Ready`; a stalled one still needs an update.
    pub fn on_activate(deactivated_from: Option<FunctionState>) -> Self {
        match deactivated_from {
            Some(Self::Stalled) => Self::Stalled,
            _ => Self::Ready,
        }
    }

    pub fn can_remove(self) -> bool {
        Self::REMOVABLE.contains(&self)
    }
}

impl std::fmt::Display for FunctionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Building => write!(f, "building"),
            Self::Built => write!(f, "built"),
            Self::Ready => write!(f, "ready"),
            Self::Updating => write!(f, "updating"),
            Self::Stalled => write!(f, "stalled"),
            Self::Terminating => write!(f, "terminating"),
            Self::Deactivated => write!(f, "deactivated"),
        }
    }
}

/// Size and rate limits of a function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSize {
    /// Memory in MB (0 = runtime default)
    #[serde(default)]
    pub memory_mb: u64,

    /// Timeout in milliseconds (0 = runtime default)
    #[serde(default)]
    pub timeout_ms: u64,

    /// Calls per second (0 = gate default)
    #[serde(default)]
    pub rate: u32,

    /// Burst (0 = same as rate)
    #[serde(default)]
    pub burst: u32,
}

/// Orchestrator deployment of one function version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentKey {
    pub cookie: String,
    pub version: String,
    pub build: bool,
}

impl DeploymentKey {
    pub fn run(cookie: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
            version: version.into(),
            build: false,
        }
    }

    pub fn build(cookie: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
            version: version.into(),
            build: true,
        }
    }

    /// Orchestrator-level deployment name
    pub fn name(&self) -> String {
        let prefix: String = self.cookie.chars().take(16).collect();
        let version: String = self
            .version
            .chars()
            .take(12)
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        if self.build {
            format!("fn-{}-{}-build", prefix, version)
        } else {
            format!("fn-{}-{}", prefix, version)
        }
    }
}

impl std::fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Durable function record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub id: OwnerId,
    pub cookie: String,
    pub lang: String,
    pub state: FunctionState,
    pub size: FunctionSize,
    /// Configured replica count; the autoscaler never shrinks below it
    pub replicas: u32,
    /// Latest source version (what is built next)
    pub version: String,
    /// Version of the deployment currently serving calls
    #[serde(default)]
    pub run_version: Option<String>,
    /// Auth context whose tokens callers must present
    #[serde(default)]
    pub auth_ctx: Option<String>,
    /// State to return to on activation while `Deactivated`
    #[serde(default)]
    pub deactivated_from: Option<FunctionState>,
    pub created_at: DateTime<Utc>,
}

impl FunctionRecord {
    /// Deployment that serves calls (falls back to the latest version)
    pub fn run_deployment(&self) -> DeploymentKey {
        let version = self.run_version.as_deref().unwrap_or(&self.version);
        DeploymentKey::run(&self.cookie, version)
    }

    /// Build deployment of the latest version
    pub fn build_deployment(&self) -> DeploymentKey {
        DeploymentKey::build(&self.cookie, &self.version)
    }
}
