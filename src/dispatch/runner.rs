//! Run-request contract with the runner process inside each pod

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{GateError, Result};

/// Request sent to a pod's runner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Per-call token the runner echoes into logs
    pub token: String,
    pub args: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Set to `"base64"` when `body` carries encoded binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<String>,
    /// Caller headers, lowercased; repeated values joined with ", "
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<serde_json::Value>,
}

/// Runner answer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Negative: failure mapped to a status; 0: success; positive: explicit status
    pub return_code: i32,
    #[serde(default)]
    pub return_value: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub run_time_micros: u64,
}

impl RunResult {
    pub fn ok(value: impl Into<String>) -> Self {
        Self {
            return_value: value.into(),
            ..Default::default()
        }
    }

    pub fn failed(code: i32, value: impl Into<String>) -> Self {
        Self {
            return_code: code,
            return_value: value.into(),
            ..Default::default()
        }
    }

    /// HTTP status for this result. Negative codes map to `-code`, zero to
    /// 200, positive codes pass through. Codes that are not valid statuses
    /// fall back to 500 for failures and 200 otherwise.
    pub fn status(&self) -> u16 {
        match self.return_code {
            c if c < 0 => match c.checked_neg() {
                Some(s) if (400..=599).contains(&s) => s as u16,
                _ => 500,
            },
            0 => 200,
            c if (100..=599).contains(&c) => c as u16,
            _ => 200,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.return_code < 0
    }
}

/// Transport to the runner process
#[async_trait]
pub trait Runner: Send + Sync {
    /// Send one run request to the pod at `address`
    async fn run(&self, address: &str, request: &RunRequest) -> Result<RunResult>;

    /// Runner name (for logging)
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// HttpRunner — JSON over HTTP
// ---------------------------------------------------------------------------

/// Posts run requests as JSON to `http://{address}{path}`
pub struct HttpRunner {
    client: reqwest::Client,
    path: String,
    port: u16,
}

impl HttpRunner {
    pub fn new(path: impl Into<String>, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            path: path.into(),
            port,
        }
    }

    /// URL of a pod's run endpoint. A bare host gets the runner port.
    pub fn url(&self, address: &str) -> String {
        if address.contains(':') {
            format!("http://{}{}", address, self.path)
        } else {
            format!("http://{}:{}{}", address, self.port, self.path)
        }
    }
}

#[async_trait]
impl Runner for HttpRunner {
    async fn run(&self, address: &str, request: &RunRequest) -> Result<RunResult> {
        let url = self.url(address);
        let resp = self.client.post(&url).json(request).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GateError::Other(format!(
                "runner at {} returned {}: {}",
                address, status, body
            )));
        }

        Ok(resp.json::<RunResult>().await?)
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ---------------------------------------------------------------------------
// MockRunner — scripted results
// ---------------------------------------------------------------------------

/// Runner that answers from a script of results, then a default
pub struct MockRunner {
    script: Mutex<VecDeque<Result<RunResult>>>,
    default: Mutex<RunResult>,
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<(String, RunRequest)>>,
    panic_on_run: Mutex<bool>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(RunResult::ok("")),
            delay: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            panic_on_run: Mutex::new(false),
        }
    }

    /// Queue one result (or error) for the next call
    pub fn push(&self, result: Result<RunResult>) {
        self.script.lock().unwrap().push_back(result);
    }

    /// Result returned once the script is exhausted
    pub fn set_default(&self, result: RunResult) {
        *self.default.lock().unwrap() = result;
    }

    /// Delay every answer, to exercise timeouts
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Panic inside `run`, to exercise panic isolation
    pub fn set_panic(&self, panic: bool) {
        *self.panic_on_run.lock().unwrap() = panic;
    }

    /// Every request received, with the address it was sent to
    pub fn requests(&self) -> Vec<(String, RunRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn run(&self, address: &str, request: &RunRequest) -> Result<RunResult> {
        self.requests
            .lock()
            .unwrap()
            .push((address.to_string(), request.clone()));

        if *self.panic_on_run.lock().unwrap() {
            panic!("mock runner panic");
        }

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(self.default.lock().unwrap().clone()),
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
