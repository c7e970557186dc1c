//! Stats persistence

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use super::StatsSnapshot;
use crate::error::{GateError, Result};

/// Storage for flushed per-function counters
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Last flushed counters, if any
    async fn load(&self, cookie: &str) -> Result<Option<StatsSnapshot>>;

    /// Persist a snapshot, replacing the previous one
    async fn save(&self, snapshot: &StatsSnapshot) -> Result<()>;

    async fn remove(&self, cookie: &str) -> Result<()>;
}

/// In-process stats store
#[derive(Debug, Default)]
pub struct MemoryStatsStore {
    snapshots: RwLock<HashMap<String, StatsSnapshot>>,
    failing: AtomicBool,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save fail, simulating an unreachable backend
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stored snapshot (synchronous, for inspection)
    pub fn get(&self, cookie: &str) -> Option<StatsSnapshot> {
        self.snapshots.read().unwrap().get(cookie).cloned()
    }
}

#[async_trait]
impl StatsStore for MemoryStatsStore {
    async fn load(&self, cookie: &str) -> Result<Option<StatsSnapshot>> {
        Ok(self.get(cookie))
    }

    async fn save(&self, snapshot: &StatsSnapshot) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GateError::Persistence("stats store unavailable".to_string()));
        }
        self.snapshots
            .write()
            .unwrap()
            .insert(snapshot.cookie.clone(), snapshot.clone());
        Ok(())
    }

    async fn remove(&self, cookie: &str) -> Result<()> {
        self.snapshots.write().unwrap().remove(cookie);
        Ok(())
    }
}
