//! Gate metrics — lightweight counters and gauges
//!
//! In-process call accounting, exported as JSON or Prometheus text.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

/// Point-in-time view of all metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Total calls answered
    pub total_calls: u64,
    /// Responses by status class (2xx, 4xx, 5xx)
    pub status_classes: HashMap<String, u64>,
    /// Rejections and failures by error code
    pub errors: HashMap<String, u64>,
    /// Calls currently being forwarded
    pub active_calls: i64,
    /// Per-function call counts
    pub function_calls: HashMap<String, u64>,
    /// Per-function cumulative latency in microseconds
    pub function_latency_us: HashMap<String, u64>,
}

/// Gate metrics collector
pub struct GateMetrics {
    total_calls: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    active_calls: AtomicI64,
    errors: RwLock<HashMap<String, u64>>,
    function_calls: RwLock<HashMap<String, u64>>,
    function_latency_us: RwLock<HashMap<String, u64>>,
}

impl GateMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            status_2xx: AtomicU64::new(0),
            status_3xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
            active_calls: AtomicI64::new(0),
            errors: RwLock::new(HashMap::new()),
            function_calls: RwLock::new(HashMap::new()),
            function_latency_us: RwLock::new(HashMap::new()),
        }
    }

    /// Record an answered call
    pub fn record_status(&self, status: u16) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let counter = match status / 100 {
            2 => &self.status_2xx,
            3 => &self.status_3xx,
            4 => &self.status_4xx,
            5 => &self.status_5xx,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejection or failure by its error code
    pub fn record_error(&self, code: &str) {
        let mut map = self.errors.write().unwrap();
        *map.entry(code.to_string()).or_insert(0) += 1;
    }

    /// Record one forwarded call for a function
    pub fn record_function_call(&self, cookie: &str, latency_us: u64) {
        {
            let mut calls = self.function_calls.write().unwrap();
            *calls.entry(cookie.to_string()).or_insert(0) += 1;
        }
        let mut latency = self.function_latency_us.write().unwrap();
        *latency.entry(cookie.to_string()).or_insert(0) += latency_us;
    }

    /// Drop per-function series of a removed function
    pub fn forget_function(&self, cookie: &str) {
        self.function_calls.write().unwrap().remove(cookie);
        self.function_latency_us.write().unwrap().remove(cookie);
    }

    pub fn inc_active(&self) {
        self.active_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active_calls.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_calls(&self) -> i64 {
        self.active_calls.load(Ordering::Relaxed)
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut status_classes = HashMap::new();
        status_classes.insert("2xx".to_string(), self.status_2xx.load(Ordering::Relaxed));
        status_classes.insert("3xx".to_string(), self.status_3xx.load(Ordering::Relaxed));
        status_classes.insert("4xx".to_string(), self.status_4xx.load(Ordering::Relaxed));
        status_classes.insert("5xx".to_string(), self.status_5xx.load(Ordering::Relaxed));

        MetricsSnapshot {
            total_calls: self.total_calls(),
            status_classes,
            errors: self.errors.read().unwrap().clone(),
            active_calls: self.active_calls(),
            function_calls: self.function_calls.read().unwrap().clone(),
            function_latency_us: self.function_latency_us.read().unwrap().clone(),
        }
    }

    /// Render metrics in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP faas_calls_total Total number of calls\n");
        output.push_str("# TYPE faas_calls_total counter\n");
        output.push_str(&format!("faas_calls_total {}\n", snap.total_calls));

        output.push_str("# HELP faas_responses_total Responses by status class\n");
        output.push_str("# TYPE faas_responses_total counter\n");
        for class in ["2xx", "3xx", "4xx", "5xx"] {
            let count = snap.status_classes.get(class).unwrap_or(&0);
            output.push_str(&format!(
                "faas_responses_total{{status_class=\"{}\"}} {}\n",
                class, count
            ));
        }

        output.push_str("# HELP faas_active_calls Calls currently being forwarded\n");
        output.push_str("# TYPE faas_active_calls gauge\n");
        output.push_str(&format!("faas_active_calls {}\n", snap.active_calls));

        if !snap.errors.is_empty() {
            output.push_str("# HELP faas_errors_total Rejections and failures by code\n");
            output.push_str("# TYPE faas_errors_total counter\n");
            for (code, count) in sorted(&snap.errors) {
                output.push_str(&format!("faas_errors_total{{code=\"{}\"}} {}\n", code, count));
            }
        }

        if !snap.function_calls.is_empty() {
            output.push_str("# HELP faas_function_calls_total Forwarded calls per function\n");
            output.push_str("# TYPE faas_function_calls_total counter\n");
            for (cookie, count) in sorted(&snap.function_calls) {
                output.push_str(&format!(
                    "faas_function_calls_total{{function=\"{}\"}} {}\n",
                    cookie, count
                ));
            }

            output.push_str(
                "# HELP faas_function_latency_microseconds_total Cumulative call latency per function\n",
            );
            output.push_str("# TYPE faas_function_latency_microseconds_total counter\n");
            for (cookie, us) in sorted(&snap.function_latency_us) {
                output.push_str(&format!(
                    "faas_function_latency_microseconds_total{{function=\"{}\"}} {}\n",
                    cookie, us
                ));
            }
        }

        output
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(map: &HashMap<String, u64>) -> Vec<(&String, &u64)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort();
    entries
}
