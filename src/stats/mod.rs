//! Per-function call statistics
//!
//! Counters are updated lock-free on the call path and marked dirty. A single
//! flusher task owns all persistence: it writes dirty counters on a periodic
//! tick and serves explicit flush jobs, so a burst of calls never turns into
//! a burst of store writes.

pub mod logs;
pub mod store;

pub use logs::{RunLog, RunLogEntry};
pub use store::{MemoryStatsStore, StatsStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

use crate::config::Settings;
use crate::error::{GateError, Result};

/// How a call ended, for accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Runner answered with a non-negative code
    Ok,
    /// Runner answered with a negative code, or the call failed after lease
    Error,
    /// Runner did not answer in time
    Timeout,
}

/// One finished call
#[derive(Debug, Clone, Copy)]
pub struct CallRecord {
    pub outcome: CallOutcome,
    /// Execution time reported by the runner
    pub run_time_us: u64,
    /// Wall time as seen by the gate
    pub call_time_us: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Persisted form of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub cookie: String,
    pub called: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub run_time_us: u64,
    pub call_time_us: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub last_call: Option<DateTime<Utc>>,
}

/// Live counters of one function
#[derive(Debug)]
pub struct FnStats {
    cookie: String,
    called: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    run_time_us: AtomicU64,
    call_time_us: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    last_call: Mutex<Option<DateTime<Utc>>>,
    dirty: AtomicBool,
}

impl FnStats {
    pub fn new(cookie: impl Into<String>) -> Self {
        Self {
            cookie: cookie.into(),
            called: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            run_time_us: AtomicU64::new(0),
            call_time_us: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            last_call: Mutex::new(None),
            dirty: AtomicBool::new(false),
        }
    }

    /// Seed from persisted counters
    fn restore(&self, snapshot: &StatsSnapshot) {
        self.called.store(snapshot.called, Ordering::Relaxed);
        self.errors.store(snapshot.errors, Ordering::Relaxed);
        self.timeouts.store(snapshot.timeouts, Ordering::Relaxed);
        self.run_time_us.store(snapshot.run_time_us, Ordering::Relaxed);
        self.call_time_us.store(snapshot.call_time_us, Ordering::Relaxed);
        self.bytes_in.store(snapshot.bytes_in, Ordering::Relaxed);
        self.bytes_out.store(snapshot.bytes_out, Ordering::Relaxed);
        *self.last_call.lock().unwrap() = snapshot.last_call;
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Account one finished call
    pub fn record(&self, call: &CallRecord) {
        self.called.fetch_add(1, Ordering::Relaxed);
        match call.outcome {
            CallOutcome::Ok => {}
            CallOutcome::Error => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            CallOutcome::Timeout => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.run_time_us.fetch_add(call.run_time_us, Ordering::Relaxed);
        self.call_time_us.fetch_add(call.call_time_us, Ordering::Relaxed);
        self.bytes_in.fetch_add(call.bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(call.bytes_out, Ordering::Relaxed);
        *self.last_call.lock().unwrap() = Some(Utc::now());
        self.dirty.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cookie: self.cookie.clone(),
            called: self.called.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            run_time_us: self.run_time_us.load(Ordering::Relaxed),
            call_time_us: self.call_time_us.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            last_call: *self.last_call.lock().unwrap(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

enum FlushJob {
    /// Write one function's counters now, acking when done
    Drain {
        stats: Arc<FnStats>,
        done: oneshot::Sender<Result<()>>,
    },
}

type Tracked = Arc<Mutex<HashMap<String, Arc<FnStats>>>>;

/// Owner of all per-function counters and of the flusher task
pub struct StatsRecorder {
    store: Arc<dyn StatsStore>,
    tracked: Tracked,
    tx: mpsc::UnboundedSender<FlushJob>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<FlushJob>>>,
    flusher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StatsRecorder {
    pub fn new(store: Arc<dyn StatsStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            tracked: Arc::new(Mutex::new(HashMap::new())),
            tx,
            rx: Mutex::new(Some(rx)),
            flusher: Mutex::new(None),
        }
    }

    /// Spawn the flusher task. Calling it twice is a no-op.
    pub fn start(&self, settings: Arc<Settings>) {
        let Some(mut rx) = self.rx.lock().unwrap().take() else {
            return;
        };
        let store = self.store.clone();
        let tracked = self.tracked.clone();

        let handle = tokio::spawn(async move {
            let mut next_flush = tokio::time::Instant::now() + settings.flush_period();
            loop {
                tokio::select! {
                    job = rx.recv() => match job {
                        Some(FlushJob::Drain { stats, done }) => {
                            let result = store.save(&stats.snapshot()).await;
                            let _ = done.send(result);
                        }
                        None => break,
                    },
                    _ = tokio::time::sleep_until(next_flush) => {
                        flush_dirty(store.as_ref(), &tracked).await;
                        next_flush = tokio::time::Instant::now() + settings.flush_period();
                    }
                }
            }
            flush_dirty(store.as_ref(), &tracked).await;
            tracing::debug!("Stats flusher stopped");
        });
        *self.flusher.lock().unwrap() = Some(handle);
    }

    /// Counters of a function, loading persisted values on first use
    pub async fn track(&self, cookie: &str) -> Arc<FnStats> {
        if let Some(stats) = self.get(cookie) {
            return stats;
        }

        let stats = Arc::new(FnStats::new(cookie));
        match self.store.load(cookie).await {
            Ok(Some(snapshot)) => stats.restore(&snapshot),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(cookie = cookie, error = %e, "Failed to load stats, starting from zero");
            }
        }

        let mut tracked = self.tracked.lock().unwrap();
        tracked
            .entry(cookie.to_string())
            .or_insert(stats)
            .clone()
    }

    /// Account a call on a runtime's counters. Counters drained while the
    /// call was in flight are tracked again so the next flush persists them.
    pub fn record(&self, stats: &Arc<FnStats>, call: &CallRecord) {
        self.tracked
            .lock()
            .unwrap()
            .entry(stats.cookie().to_string())
            .or_insert_with(|| stats.clone());
        stats.record(call);
    }

    pub fn get(&self, cookie: &str) -> Option<Arc<FnStats>> {
        self.tracked.lock().unwrap().get(cookie).cloned()
    }

    /// Flush a function's counters synchronously and stop tracking it
    pub async fn drain(&self, cookie: &str) -> Result<()> {
        let Some(stats) = self.tracked.lock().unwrap().remove(cookie) else {
            return Ok(());
        };

        if self.flusher.lock().unwrap().is_none() {
            return self.store.save(&stats.snapshot()).await;
        }

        let (done, ack) = oneshot::channel();
        self.tx
            .send(FlushJob::Drain { stats, done })
            .map_err(|_| GateError::Other("stats flusher is not running".to_string()))?;
        ack.await
            .map_err(|_| GateError::Other("stats flusher dropped the drain".to_string()))?
    }

    /// Write every dirty counter set now
    pub async fn flush(&self) {
        flush_dirty(self.store.as_ref(), &self.tracked).await;
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().unwrap().len()
    }

    /// Stop the flusher after a final flush
    pub async fn shutdown(&self) {
        self.flush().await;
        let handle = self.flusher.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

async fn flush_dirty(store: &dyn StatsStore, tracked: &Tracked) {
    let dirty: Vec<Arc<FnStats>> = tracked
        .lock()
        .unwrap()
        .values()
        .filter(|s| s.take_dirty())
        .cloned()
        .collect();

    for stats in dirty {
        if let Err(e) = store.save(&stats.snapshot()).await {
            // Retried on the next tick
            stats.mark_dirty();
            tracing::warn!(cookie = stats.cookie(), error = %e, "Stats flush failed");
        }
    }
}
