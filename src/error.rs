//! Centralized error types for the A3S FaaS gate

use thiserror::Error;

/// Gate error types
#[derive(Debug, Error)]
pub enum GateError {
    /// Admission control rejected the call (function, tenant or global limiter)
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Accumulated usage exceeded a configured quota
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    /// No healthy pods, or no balancer link for the deployment
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The runner reported a negative return code
    #[error("Runner failure ({code}): {message}")]
    RunnerFailure { code: u16, message: String },

    /// Run request exceeded its bound
    #[error("Run timed out after {0}ms")]
    Timeout(u64),

    /// Function store or stats store failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid configuration or function size limits
    #[error("Configuration error: {0}")]
    Config(String),

    /// Function (or other record) not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Identity claims could not be established
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed inbound call
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Container orchestrator failure
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl GateError {
    /// HTTP status code surfaced to the caller
    pub fn status(&self) -> u16 {
        match self {
            Self::RateLimited(_) => 429,
            Self::ResourceExhausted(_) => 423,
            Self::Unavailable(_) => 503,
            Self::RunnerFailure { code, .. } => *code,
            Self::Timeout(_) => 504,
            Self::Config(_) | Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::InvalidState(_) => 409,
            Self::Unauthorized(_) => 401,
            Self::Persistence(_)
            | Self::Orchestrator(_)
            | Self::Http(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Other(_) => 500,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::ResourceExhausted(_) => "resources_exhausted",
            Self::Unavailable(_) => "unavailable",
            Self::RunnerFailure { .. } => "runner_failure",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config_error",
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Unauthorized(_) => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::Persistence(_)
            | Self::Orchestrator(_)
            | Self::Http(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Other(_) => "internal_error",
        }
    }

    /// Whether the detail of this error must stay server-side
    pub fn is_internal(&self) -> bool {
        self.status() == 500
    }

    /// Client-visible message. Internal failures never leak their detail.
    pub fn client_message(&self) -> String {
        match self {
            Self::RunnerFailure { message, .. } => message.clone(),
            e if e.is_internal() => "Internal server error".to_string(),
            e => e.to_string(),
        }
    }

    /// JSON rejection body: `{"code": "...", "message": "..."}`
    pub fn to_body(&self) -> String {
        serde_json::json!({
            "code": self.code(),
            "message": self.client_message(),
        })
        .to_string()
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, GateError>;
