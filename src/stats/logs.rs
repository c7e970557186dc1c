//! Recent runner output of one function
//!
//! Every run whose runner printed something leaves one entry. The ring is
//! bounded both in entries and in bytes per stream, so a chatty function
//! cannot grow the gate's memory.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Entries kept per function
pub const RUN_LOG_CAPACITY: usize = 100;

/// Bytes kept of each stream of one run
pub const RUN_LOG_MAX_OUTPUT: usize = 16 * 1024;

/// Output of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunLogEntry {
    pub time: DateTime<Utc>,
    /// Call token, `build-{version}` for builds
    pub token: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

/// Bounded ring of runner output, oldest first
#[derive(Debug)]
pub struct RunLog {
    entries: Mutex<VecDeque<RunLogEntry>>,
    capacity: usize,
}

impl RunLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(RUN_LOG_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    /// Keep the output of one run. Silent runs are skipped.
    pub fn push(&self, token: &str, stdout: &str, stderr: &str) {
        if stdout.is_empty() && stderr.is_empty() {
            return;
        }
        let entry = RunLogEntry {
            time: Utc::now(),
            token: token.to_string(),
            stdout: clip(stdout).to_string(),
            stderr: clip(stderr).to_string(),
        };

        let mut entries = self.entries.lock().unwrap();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<RunLogEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new(RUN_LOG_CAPACITY)
    }
}

/// Leading part of `text` within the per-stream limit, cut on a char boundary
fn clip(text: &str) -> &str {
    if text.len() <= RUN_LOG_MAX_OUTPUT {
        return text;
    }
    let mut end = RUN_LOG_MAX_OUTPUT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
