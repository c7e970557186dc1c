//! Durable storage of function records
//!
//! The gate only needs a narrow contract from its backing store: keyed
//! get/put, listing, and a conditional state change that succeeds only when
//! the current state is one of an allowed set.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use super::function::{FunctionRecord, FunctionState};
use crate::error::{GateError, Result};

/// Persistence contract for function records
#[async_trait]
pub trait FunctionStore: Send + Sync {
    /// Insert a new record; fails if the cookie is taken
    async fn insert(&self, record: &FunctionRecord) -> Result<()>;

    /// Fetch a record by cookie
    async fn get(&self, cookie: &str) -> Result<FunctionRecord>;

    /// Overwrite an existing record
    async fn update(&self, record: &FunctionRecord) -> Result<()>;

    /// Set the state only if the current one is listed in `from`
    async fn set_state_cond(
        &self,
        cookie: &str,
        to: FunctionState,
        from: &[FunctionState],
    ) -> Result<FunctionRecord>;

    /// Overwrite a record only if its stored state is listed in `from`
    async fn update_cond(&self, record: &FunctionRecord, from: &[FunctionState]) -> Result<()>;

    /// Delete a record; deleting a missing record is not an error
    async fn remove(&self, cookie: &str) -> Result<()>;

    /// All records, optionally restricted to one tenant
    async fn list(&self, tenant: Option<&str>) -> Result<Vec<FunctionRecord>>;

    /// Backend name for logging
    fn name(&self) -> &str;

    /// Unconditional state change
    async fn set_state(&self, cookie: &str, to: FunctionState) -> Result<FunctionRecord> {
        let mut record = self.get(cookie).await?;
        record.state = to;
        self.update(&record).await?;
        Ok(record)
    }
}

/// In-process store used for single-node deployments and tests
#[derive(Debug, Default)]
pub struct MemoryFunctionStore {
    records: RwLock<HashMap<String, FunctionRecord>>,
    failing: AtomicBool,
}

impl MemoryFunctionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail, simulating an unreachable backend
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GateError::Persistence("store unavailable".to_string()));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FunctionStore for MemoryFunctionStore {
    async fn insert(&self, record: &FunctionRecord) -> Result<()> {
        self.check_writable()?;
        let mut records = self.records.write().unwrap();
        if records.contains_key(&record.cookie) {
            return Err(GateError::InvalidState(format!(
                "function {} already exists",
                record.id
            )));
        }
        records.insert(record.cookie.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, cookie: &str) -> Result<FunctionRecord> {
        self.records
            .read()
            .unwrap()
            .get(cookie)
            .cloned()
            .ok_or_else(|| GateError::NotFound(format!("function {}", cookie)))
    }

    async fn update(&self, record: &FunctionRecord) -> Result<()> {
        self.check_writable()?;
        let mut records = self.records.write().unwrap();
        match records.get_mut(&record.cookie) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(GateError::NotFound(format!("function {}", record.cookie))),
        }
    }

    async fn set_state_cond(
        &self,
        cookie: &str,
        to: FunctionState,
        from: &[FunctionState],
    ) -> Result<FunctionRecord> {
        self.check_writable()?;
        let mut records = self.records.write().unwrap();
        let record = records
            .get_mut(cookie)
            .ok_or_else(|| GateError::NotFound(format!("function {}", cookie)))?;
        if !from.contains(&record.state) {
            return Err(GateError::InvalidState(format!(
                "function {} is {}, cannot become {}",
                record.id, record.state, to
            )));
        }
        record.state = to;
        Ok(record.clone())
    }

    async fn update_cond(&self, record: &FunctionRecord, from: &[FunctionState]) -> Result<()> {
        self.check_writable()?;
        let mut records = self.records.write().unwrap();
        let existing = records
            .get_mut(&record.cookie)
            .ok_or_else(|| GateError::NotFound(format!("function {}", record.cookie)))?;
        if !from.contains(&existing.state) {
            return Err(GateError::InvalidState(format!(
                "function {} is {}, cannot become {}",
                existing.id, existing.state, record.state
            )));
        }
        *existing = record.clone();
        Ok(())
    }

    async fn remove(&self, cookie: &str) -> Result<()> {
        self.check_writable()?;
        self.records.write().unwrap().remove(cookie);
        Ok(())
    }

    async fn list(&self, tenant: Option<&str>) -> Result<Vec<FunctionRecord>> {
        let records = self.records.read().unwrap();
        let mut list: Vec<FunctionRecord> = records
            .values()
            .filter(|r| tenant.map(|t| r.id.tenant == t).unwrap_or(true))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::function::{FunctionSize, OwnerId};

    fn record(tenant: &str, name: &str, state: FunctionState) -> FunctionRecord {
        let id = OwnerId::new(tenant, "p", name);
        FunctionRecord {
            cookie: id.cookie(),
            id,
            lang: "python".to_string(),
            state,
            size: FunctionSize::default(),
            replicas: 1,
            version: "v1".to_string(),
            run_version: None,
            auth_ctx: None,
            deactivated_from: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryFunctionStore::new();
        let rec = record("t", "f", FunctionState::Queued);
        store.insert(&rec).await.unwrap();
        assert_eq!(store.get(&rec.cookie).await.unwrap(), rec);
        assert!(store.insert(&rec).await.is_err());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryFunctionStore::new();
        assert!(matches!(
            store.get("nope").await,
            Err(GateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_state_cond() {
        let store = MemoryFunctionStore::new();
        let rec = record("t", "f", FunctionState::Building);
        store.insert(&rec).await.unwrap();

        let err = store
            .set_state_cond(&rec.cookie, FunctionState::Terminating, FunctionState::REMOVABLE)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::InvalidState(_)));
        assert_eq!(
            store.get(&rec.cookie).await.unwrap().state,
            FunctionState::Building
        );

        store
            .set_state(&rec.cookie, FunctionState::Ready)
            .await
            .unwrap();
        let updated = store
            .set_state_cond(&rec.cookie, FunctionState::Terminating, FunctionState::REMOVABLE)
            .await
            .unwrap();
        assert_eq!(updated.state, FunctionState::Terminating);
    }

    #[tokio::test]
    async fn test_update_cond_keeps_concurrent_state() {
        let store = MemoryFunctionStore::new();
        let rec = record("t", "f", FunctionState::Queued);
        store.insert(&rec).await.unwrap();
        store
            .set_state(&rec.cookie, FunctionState::Terminating)
            .await
            .unwrap();

        let mut stale = rec.clone();
        stale.state = FunctionState::Ready;
        stale.run_version = Some("v1".to_string());
        let err = store
            .update_cond(&stale, &[FunctionState::Queued])
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::InvalidState(_)));
        let stored = store.get(&rec.cookie).await.unwrap();
        assert_eq!(stored.state, FunctionState::Terminating);
        assert_eq!(stored.run_version, None);

        store
            .update_cond(&stale, &[FunctionState::Terminating])
            .await
            .unwrap();
        assert_eq!(store.get(&rec.cookie).await.unwrap(), stale);
    }

    #[tokio::test]
    async fn test_list_by_tenant() {
        let store = MemoryFunctionStore::new();
        store.insert(&record("a", "f1", FunctionState::Ready)).await.unwrap();
        store.insert(&record("a", "f2", FunctionState::Ready)).await.unwrap();
        store.insert(&record("b", "f1", FunctionState::Ready)).await.unwrap();
        assert_eq!(store.list(None).await.unwrap().len(), 3);
        assert_eq!(store.list(Some("a")).await.unwrap().len(), 2);
        assert!(store.list(Some("c")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryFunctionStore::new();
        let rec = record("t", "f", FunctionState::Ready);
        store.insert(&rec).await.unwrap();
        store.set_failing(true);
        assert!(matches!(
            store.set_state(&rec.cookie, FunctionState::Stalled).await,
            Err(GateError::Persistence(_))
        ));
        // Reads still work
        assert!(store.get(&rec.cookie).await.is_ok());
        store.set_failing(false);
        store.remove(&rec.cookie).await.unwrap();
        assert!(store.is_empty());
    }
}
