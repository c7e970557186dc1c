//! Function lifecycle — add, update, remove and pod notifications
//!
//! Every operation that touches more than one collaborator keeps a stack of
//! compensating actions and unwinds it in reverse order when a later step
//! fails. Failures on the build path leave the function `Stalled`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::balancer::{Balancer, Lookup};
use crate::dispatch::{RunRequest, Runner};
use crate::error::{GateError, Result};
use crate::registry::{
    DeploymentKey, FunctionRecord, FunctionRegistry, FunctionSize, FunctionState, OwnerId,
};
use crate::scaling::autoscaler::Autoscaler;
use crate::scaling::orchestrator::{DeploymentSpec, Orchestrator, ScaleDecision, ScaleDirection};
use crate::stats::StatsRecorder;

/// Attempts at persisting the `Stalled` state after a failed build
const STALL_RETRIES: u32 = 3;
const STALL_BACKOFF: Duration = Duration::from_millis(200);

/// New function definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub tenant: String,
    pub project: String,
    pub name: String,
    pub lang: String,
    /// Source version to deploy
    pub version: String,
    #[serde(default)]
    pub size: FunctionSize,
    /// Replica floor (clamped into `[1, max_replicas]`)
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub auth_ctx: Option<String>,
}

impl FunctionSpec {
    pub fn owner(&self) -> OwnerId {
        OwnerId::new(&self.tenant, &self.project, &self.name)
    }
}

/// Changes to an existing function. A new `version` goes through the
/// build/deploy path; everything else is applied in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionUpdate {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub size: Option<FunctionSize>,
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub auth_ctx: Option<String>,
}

/// Pod readiness notification from the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodEvent {
    pub deployment: DeploymentKey,
    pub ready: bool,
}

/// Function view served by the management API
#[derive(Debug, Clone, Serialize)]
pub struct FunctionInfo {
    #[serde(flatten)]
    pub record: FunctionRecord,
    pub goal: u32,
    pub in_flight: u64,
    pub healthy_replicas: u32,
}

/// Compensating action of a partially applied operation
#[derive(Debug)]
enum Undo {
    RemoveRecord(String),
    RestoreRecord(Box<FunctionRecord>),
}

/// Drives functions through their states
pub struct Lifecycle {
    registry: Arc<FunctionRegistry>,
    balancer: Arc<Balancer>,
    autoscaler: Arc<Autoscaler>,
    orchestrator: Arc<dyn Orchestrator>,
    runner: Arc<dyn Runner>,
    stats: Arc<StatsRecorder>,
}

impl Lifecycle {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        balancer: Arc<Balancer>,
        autoscaler: Arc<Autoscaler>,
        orchestrator: Arc<dyn Orchestrator>,
        runner: Arc<dyn Runner>,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            registry,
            balancer,
            autoscaler,
            orchestrator,
            runner,
            stats,
        }
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Register a function and request its first deployment
    pub async fn add(&self, spec: FunctionSpec) -> Result<FunctionRecord> {
        let id = spec.owner();
        id.validate()?;
        if spec.version.is_empty() {
            return Err(GateError::BadRequest("version is required".to_string()));
        }
        self.registry.language(&spec.lang)?;
        let size = self.registry.normalize_size(spec.size)?;
        let replicas = self.registry.normalize_replicas(spec.replicas);
        let requires_build = self.registry.requires_build(&spec.lang);

        let record = FunctionRecord {
            cookie: id.cookie(),
            id,
            lang: spec.lang,
            state: FunctionState::on_add(requires_build),
            size,
            replicas,
            version: spec.version,
            run_version: None,
            auth_ctx: spec.auth_ctx,
            deactivated_from: None,
            created_at: chrono::Utc::now(),
        };

        let mut undo = Vec::new();
        self.registry.store().insert(&record).await?;
        undo.push(Undo::RemoveRecord(record.cookie.clone()));

        let deployment = if requires_build {
            DeploymentSpec::new(&record.build_deployment(), &record.lang, 1, &record.size)
        } else {
            DeploymentSpec::new(&record.run_deployment(), &record.lang, replicas, &record.size)
        };
        if let Err(e) = self.orchestrator.run_deployment(&deployment).await {
            self.rollback(undo).await;
            return Err(e);
        }

        tracing::info!(
            cookie = %record.cookie,
            function = %record.id,
            state = %record.state,
            deployment = %deployment.name,
            "Function added"
        );
        Ok(record)
    }

    /// Apply an update. Size, replica and auth changes apply in place; a new
    /// version restarts the build/deploy path.
    pub async fn update(&self, cookie: &str, update: FunctionUpdate) -> Result<FunctionRecord> {
        let before = self.registry.store().get(cookie).await?;
        let mut record = before.clone();

        if let Some(size) = update.size {
            record.size = self.registry.normalize_size(size)?;
        }
        if let Some(replicas) = update.replicas {
            record.replicas = self.registry.normalize_replicas(replicas);
        }
        if update.auth_ctx.is_some() {
            record.auth_ctx = update.auth_ctx;
        }

        let new_version = update.version.filter(|v| *v != record.version);
        let Some(version) = new_version else {
            self.registry
                .store()
                .update_cond(&record, &[before.state])
                .await?;
            self.registry.sync(&record);
            if record.replicas != before.replicas && record.state.is_serving() {
                let rt = self.registry.runtime(cookie).await?;
                self.autoscaler.start(&rt, record.replicas);
            }
            tracing::info!(cookie, "Function reconfigured");
            return Ok(record);
        };

        let requires_build = self.registry.requires_build(&record.lang);
        record.state = record.state.on_update(requires_build)?;
        record.version = version;

        let mut undo = Vec::new();
        self.registry
            .store()
            .update_cond(&record, &[before.state])
            .await?;
        self.registry.sync(&record);
        undo.push(Undo::RestoreRecord(Box::new(before)));

        let deployment = if requires_build {
            DeploymentSpec::new(&record.build_deployment(), &record.lang, 1, &record.size)
        } else {
            let key = DeploymentKey::run(cookie, &record.version);
            DeploymentSpec::new(&key, &record.lang, record.replicas, &record.size)
        };
        if let Err(e) = self.orchestrator.run_deployment(&deployment).await {
            tracing::error!(cookie, error = %e, "Update deployment failed");
            self.rollback(undo).await;
            self.mark_stalled(cookie).await;
            return Err(e);
        }

        tracing::info!(
            cookie,
            version = %record.version,
            state = %record.state,
            "Function update started"
        );
        Ok(record)
    }

    /// Remove a function. Only `Ready` and `Stalled` functions can go; the
    /// conditional transition keeps a concurrent build from racing past it.
    pub async fn remove(&self, cookie: &str) -> Result<()> {
        let record = self
            .registry
            .store()
            .set_state_cond(cookie, FunctionState::Terminating, FunctionState::REMOVABLE)
            .await?;
        self.registry.sync(&record);

        if let Some(rt) = self.registry.loaded(cookie) {
            self.autoscaler.retire(&rt);
        }

        let mut keys = self.balancer.forget(cookie);
        for key in [record.run_deployment(), record.build_deployment()] {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        for key in &keys {
            if let Err(e) = self.orchestrator.remove_deployment(&key.name()).await {
                tracing::error!(cookie, deployment = %key, error = %e, "Remove deployment failed");
            }
        }

        if let Err(e) = self.stats.drain(cookie).await {
            tracing::error!(cookie, error = %e, "Stats drain failed");
        }
        self.registry.evict(cookie);
        self.registry.store().remove(cookie).await?;

        tracing::info!(cookie, function = %record.id, "Function removed");
        Ok(())
    }

    /// Switch a function off without losing it. The state it had is kept so
    /// activation can restore it.
    pub async fn deactivate(&self, cookie: &str) -> Result<FunctionRecord> {
        let mut record = self.registry.store().get(cookie).await?;
        let from = record.state;
        if !FunctionState::DEACTIVATABLE.contains(&from) {
            return Err(GateError::InvalidState(format!(
                "function {} is {}, cannot become {}",
                record.id,
                from,
                FunctionState::Deactivated
            )));
        }
        record.state = FunctionState::Deactivated;
        record.deactivated_from = Some(from);
        self.registry.store().update_cond(&record, &[from]).await?;
        self.registry.sync(&record);

        if let Some(rt) = self.registry.loaded(cookie) {
            self.autoscaler.stop(&rt);
        }
        let key = record.run_deployment();
        let decision = ScaleDecision {
            deployment: key.name(),
            direction: ScaleDirection::Down,
            replicas: 0,
            reason: "function deactivated".to_string(),
        };
        if let Err(e) = self.orchestrator.scale(&decision).await {
            tracing::warn!(cookie, error = %e, "Scale to zero failed");
        }
        self.balancer.forget_deployment(&key);

        tracing::info!(cookie, from = %from, "Function deactivated");
        Ok(record)
    }

    /// Bring a deactivated function back. A function deactivated while
    /// `Stalled` stays stalled and is not deployed.
    pub async fn activate(&self, cookie: &str) -> Result<FunctionRecord> {
        let before = self.registry.store().get(cookie).await?;
        if before.state != FunctionState::Deactivated {
            return Err(GateError::InvalidState(format!(
                "function {} is {}, not deactivated",
                before.id, before.state
            )));
        }
        let mut record = before.clone();
        record.state = FunctionState::on_activate(before.deactivated_from);
        record.deactivated_from = None;
        self.registry
            .store()
            .update_cond(&record, &[FunctionState::Deactivated])
            .await?;
        self.registry.sync(&record);

        if record.state != FunctionState::Ready {
            tracing::info!(cookie, state = %record.state, "Function activated without deployment");
            return Ok(record);
        }

        let deployment = DeploymentSpec::new(
            &record.run_deployment(),
            &record.lang,
            record.replicas,
            &record.size,
        );
        if let Err(e) = self.orchestrator.run_deployment(&deployment).await {
            match self
                .registry
                .store()
                .update_cond(&before, &[FunctionState::Ready])
                .await
            {
                Ok(()) => self.registry.sync(&before),
                Err(e) => tracing::error!(cookie, error = %e, "Failed to restore deactivated state"),
            }
            return Err(e);
        }

        let rt = self.registry.runtime(cookie).await?;
        self.autoscaler.start(&rt, record.replicas);
        tracing::info!(cookie, "Function activated");
        Ok(record)
    }

    /// React to a pod of one of the function's deployments changing readiness
    pub async fn pod_ready(&self, event: PodEvent) -> Result<()> {
        let key = event.deployment;
        if let Err(e) = self.balancer.refresh(&key).await {
            tracing::warn!(deployment = %key, error = %e, "Balancer refresh failed");
        }
        if !event.ready {
            tracing::debug!(deployment = %key, "Pod stopped");
            return Ok(());
        }

        let record = self.registry.store().get(&key.cookie).await?;
        if key.version != record.version {
            tracing::debug!(deployment = %key, "Pod of a superseded version");
            return Ok(());
        }

        match (record.state, key.build) {
            (FunctionState::Building | FunctionState::Updating, true) => {
                self.build(record).await
            }
            (FunctionState::Built | FunctionState::Queued, false) => {
                self.go_ready(record, &key).await
            }
            (FunctionState::Ready | FunctionState::Updating, false)
                if record.run_version.as_deref() != Some(key.version.as_str()) =>
            {
                self.go_ready(record, &key).await
            }
            (state, _) => {
                tracing::debug!(deployment = %key, state = %state, "Pod ready, nothing to do");
                Ok(())
            }
        }
    }

    /// Run the build on the build deployment, then request the run deployment
    async fn build(&self, record: FunctionRecord) -> Result<()> {
        let cookie = record.cookie.clone();
        let build_key = record.build_deployment();
        let info = self.registry.language(&record.lang)?.clone();

        let outcome = self.run_build(&record, &build_key, &info.build_cmd).await;

        if let Err(e) = self.orchestrator.remove_deployment(&build_key.name()).await {
            tracing::warn!(cookie = %cookie, error = %e, "Build deployment removal failed");
        }
        self.balancer.forget_deployment(&build_key);

        if let Err(e) = outcome {
            tracing::error!(cookie = %cookie, version = %record.version, error = %e, "Build failed");
            self.mark_stalled(&cookie).await;
            return Err(e);
        }

        let from = record.state;
        let to = match from {
            FunctionState::Building => FunctionState::Built,
            _ => FunctionState::Ready,
        };
        let updated = match self.registry.store().set_state_cond(&cookie, to, &[from]).await {
            Ok(rec) => rec,
            Err(e) => {
                self.mark_stalled(&cookie).await;
                return Err(e);
            }
        };
        self.registry.sync(&updated);

        let key = DeploymentKey::run(&cookie, &updated.version);
        let deployment = DeploymentSpec::new(&key, &updated.lang, updated.replicas, &updated.size);
        if let Err(e) = self.orchestrator.run_deployment(&deployment).await {
            tracing::error!(cookie = %cookie, error = %e, "Run deployment failed after build");
            self.mark_stalled(&cookie).await;
            return Err(e);
        }

        tracing::info!(cookie = %cookie, version = %updated.version, state = %to, "Function built");
        Ok(())
    }

    async fn run_build(
        &self,
        record: &FunctionRecord,
        key: &DeploymentKey,
        build_cmd: &[String],
    ) -> Result<()> {
        let rt = self.registry.runtime(&record.cookie).await?;
        let lease = self.balancer.acquire(&rt, &Lookup::Exact(key.clone())).await?;

        let mut args = HashMap::new();
        args.insert("cmd".to_string(), build_cmd.join(" "));
        let request = RunRequest {
            token: format!("build-{}", record.version),
            args,
            method: "POST".to_string(),
            path: "/build".to_string(),
            ..Default::default()
        };

        let timeout = self.registry.settings().runner_timeout();
        let result = tokio::time::timeout(timeout, self.runner.run(lease.address(), &request)).await;
        self.balancer.release_connection(lease);

        let result = result.map_err(|_| GateError::Timeout(timeout.as_millis() as u64))??;
        rt.logs().push(&request.token, &result.stdout, &result.stderr);
        if result.return_code != 0 || !result.stderr.is_empty() {
            return Err(GateError::Other(format!(
                "build exited with {}: {}",
                result.return_code, result.stderr
            )));
        }
        Ok(())
    }

    /// Make `key` the serving deployment and start scaling it
    async fn go_ready(&self, mut record: FunctionRecord, key: &DeploymentKey) -> Result<()> {
        let cookie = record.cookie.clone();
        let from = record.state;
        record.state = FunctionState::Ready;
        record.run_version = Some(key.version.clone());

        // Conditional so a concurrent removal wins
        self.registry.store().update_cond(&record, &[from]).await?;
        self.registry.sync(&record);

        let rt = self.registry.runtime(&cookie).await?;
        self.autoscaler.start(&rt, record.replicas);

        for stale in self.balancer.stale_deployments(&cookie, key) {
            if let Err(e) = self.orchestrator.remove_deployment(&stale.name()).await {
                tracing::warn!(cookie = %cookie, deployment = %stale, error = %e, "Stale deployment removal failed");
                continue;
            }
            self.balancer.forget_deployment(&stale);
        }

        tracing::info!(cookie = %cookie, version = %key.version, "Function ready");
        Ok(())
    }

    /// Persist `Stalled`, retrying; the in-memory record is switched first
    /// so calls stop even if the store keeps failing.
    async fn mark_stalled(&self, cookie: &str) {
        if let Some(rt) = self.registry.loaded(cookie) {
            let mut record = rt.record();
            record.state = FunctionState::Stalled;
            self.registry.sync(&record);
            self.autoscaler.stop(&rt);
        }

        for attempt in 1..=STALL_RETRIES {
            match self
                .registry
                .store()
                .set_state(cookie, FunctionState::Stalled)
                .await
            {
                Ok(record) => {
                    self.registry.sync(&record);
                    return;
                }
                Err(e) => {
                    tracing::error!(cookie, attempt, error = %e, "Failed to persist stalled state");
                    tokio::time::sleep(STALL_BACKOFF * attempt).await;
                }
            }
        }
    }

    /// Unwind compensating actions in reverse order
    async fn rollback(&self, mut undo: Vec<Undo>) {
        while let Some(action) = undo.pop() {
            let result = match &action {
                Undo::RemoveRecord(cookie) => {
                    self.registry.evict(cookie);
                    self.registry.store().remove(cookie).await
                }
                Undo::RestoreRecord(record) => {
                    let result = self.registry.store().update(record).await;
                    self.registry.sync(record);
                    result
                }
            };
            if let Err(e) = result {
                tracing::error!(action = ?action, error = %e, "Rollback step failed");
            }
        }
    }

    /// Function view with its live scaling state
    pub async fn info(&self, cookie: &str) -> Result<FunctionInfo> {
        let record = self.registry.store().get(cookie).await?;
        let (goal, in_flight) = match self.registry.loaded(cookie) {
            Some(rt) => (rt.scaler_state().goal, rt.in_flight()),
            None => (0, 0),
        };
        let healthy_replicas = self
            .balancer
            .link(&record.run_deployment())
            .map(|l| l.healthy())
            .unwrap_or(0);
        Ok(FunctionInfo {
            record,
            goal,
            in_flight,
            healthy_replicas,
        })
    }

    pub async fn list(&self, tenant: Option<&str>) -> Result<Vec<FunctionRecord>> {
        self.registry.store().list(tenant).await
    }

    /// Restart scaling for functions that were serving before a restart
    pub async fn resume(&self) -> Result<usize> {
        let mut resumed = 0;
        for record in self.registry.store().list(None).await? {
            if !record.state.is_serving() {
                continue;
            }
            let rt = self.registry.runtime(&record.cookie).await?;
            if let Err(e) = self.balancer.refresh(&record.run_deployment()).await {
                tracing::warn!(cookie = %record.cookie, error = %e, "Balancer refresh failed");
            }
            self.autoscaler.start(&rt, record.replicas);
            resumed += 1;
        }
        if resumed > 0 {
            tracing::info!(count = resumed, "Resumed serving functions");
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeConfig, Settings};
    use crate::dispatch::{MockRunner, RunResult};
    use crate::registry::{FunctionStore, MemoryFunctionStore};
    use crate::scaling::orchestrator::MockOrchestrator;
    use crate::stats::{CallOutcome, CallRecord, MemoryStatsStore};

    struct Harness {
        lifecycle: Lifecycle,
        orchestrator: Arc<MockOrchestrator>,
        runner: Arc<MockRunner>,
        store: Arc<MemoryFunctionStore>,
        stats_store: Arc<MemoryStatsStore>,
        balancer: Arc<Balancer>,
    }

    fn harness() -> Harness {
        let settings = Arc::new(Settings::default());
        let stats_store = Arc::new(MemoryStatsStore::new());
        let stats = Arc::new(StatsRecorder::new(stats_store.clone()));
        let store = Arc::new(MemoryFunctionStore::new());
        let registry = Arc::new(FunctionRegistry::new(
            store.clone(),
            &RuntimeConfig::default(),
            settings.clone(),
            stats.clone(),
        ));
        let orchestrator = Arc::new(MockOrchestrator::new());
        let balancer = Arc::new(Balancer::new(orchestrator.clone()));
        let autoscaler = Arc::new(Autoscaler::new(orchestrator.clone(), settings));
        let runner = Arc::new(MockRunner::new());
        let lifecycle = Lifecycle::new(
            registry,
            balancer.clone(),
            autoscaler,
            orchestrator.clone(),
            runner.clone(),
            stats,
        );
        Harness {
            lifecycle,
            orchestrator,
            runner,
            store,
            stats_store,
            balancer,
        }
    }

    fn spec(lang: &str) -> FunctionSpec {
        FunctionSpec {
            tenant: "acme".into(),
            project: "web".into(),
            name: "hello".into(),
            lang: lang.into(),
            version: "v1".into(),
            size: FunctionSize::default(),
            replicas: 2,
            auth_ctx: None,
        }
    }

    async fn state(h: &Harness, cookie: &str) -> FunctionState {
        h.store.get(cookie).await.unwrap().state
    }

    async fn ready(h: &Harness, key: DeploymentKey) {
        h.lifecycle
            .pod_ready(PodEvent {
                deployment: key,
                ready: true,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_without_build_goes_ready_on_pod() {
        let h = harness();
        let rec = h.lifecycle.add(spec("python")).await.unwrap();
        assert_eq!(rec.state, FunctionState::Queued);
        assert_eq!(rec.size.memory_mb, 128);
        assert!(h.orchestrator.has_deployment(&rec.run_deployment().name()));

        ready(&h, rec.run_deployment()).await;
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Ready);
        let info = h.lifecycle.info(&rec.cookie).await.unwrap();
        assert_eq!(info.goal, 2);
        assert_eq!(info.healthy_replicas, 2);
        assert_eq!(info.record.run_version.as_deref(), Some("v1"));
        h.lifecycle.remove(&rec.cookie).await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_does_not_overwrite_terminating() {
        let h = harness();
        let rec = h.lifecycle.add(spec("python")).await.unwrap();
        // A removal got as far as Terminating before the pod came up
        h.store
            .set_state(&rec.cookie, FunctionState::Terminating)
            .await
            .unwrap();

        let err = h
            .lifecycle
            .go_ready(rec.clone(), &rec.run_deployment())
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::InvalidState(_)));
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Terminating);
        if let Some(rt) = h.lifecycle.registry().loaded(&rec.cookie) {
            assert_eq!(rt.scaler_state().goal, 0);
        }
    }

    #[tokio::test]
    async fn test_add_with_build() {
        let h = harness();
        let rec = h.lifecycle.add(spec("golang")).await.unwrap();
        assert_eq!(rec.state, FunctionState::Building);
        let build = rec.build_deployment();
        assert!(h.orchestrator.has_deployment(&build.name()));

        ready(&h, build.clone()).await;
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Built);
        assert!(!h.orchestrator.has_deployment(&build.name()));
        assert!(h.orchestrator.has_deployment(&rec.run_deployment().name()));
        let requests = h.runner.requests();
        assert_eq!(requests[0].1.path, "/build");
        assert_eq!(requests[0].1.args["cmd"], "go build -o function");

        ready(&h, rec.run_deployment()).await;
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Ready);
        h.lifecycle.remove(&rec.cookie).await.unwrap();
    }

    #[tokio::test]
    async fn test_build_failure_stalls() {
        let h = harness();
        let rec = h.lifecycle.add(spec("golang")).await.unwrap();
        h.runner.push(Ok(RunResult {
            return_code: 1,
            stderr: "syntax error".into(),
            ..Default::default()
        }));
        let err = h
            .lifecycle
            .pod_ready(PodEvent {
                deployment: rec.build_deployment(),
                ready: true,
            })
            .await;
        assert!(err.is_err());
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Stalled);
        assert!(!h.orchestrator.has_deployment(&rec.build_deployment().name()));

        let rt = h.lifecycle.registry().runtime(&rec.cookie).await.unwrap();
        let logs = rt.logs().entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].token, format!("build-{}", rec.version));
        assert_eq!(logs[0].stderr, "syntax error");
    }

    #[tokio::test]
    async fn test_stalled_function_stays_stalled_across_deactivation() {
        let h = harness();
        let rec = h.lifecycle.add(spec("golang")).await.unwrap();
        h.runner.push(Ok(RunResult::failed(1, "")));
        let _ = h
            .lifecycle
            .pod_ready(PodEvent {
                deployment: rec.build_deployment(),
                ready: true,
            })
            .await;
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Stalled);

        let off = h.lifecycle.deactivate(&rec.cookie).await.unwrap();
        assert_eq!(off.deactivated_from, Some(FunctionState::Stalled));

        let on = h.lifecycle.activate(&rec.cookie).await.unwrap();
        assert_eq!(on.state, FunctionState::Stalled);
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Stalled);
        assert!(!h.orchestrator.has_deployment(&rec.run_deployment().name()));
        let rt = h.lifecycle.registry().runtime(&rec.cookie).await.unwrap();
        assert_eq!(rt.scaler_state().goal, 0);
        assert!(!rt.record().state.is_serving());

        // Still only update or remove
        assert!(h.lifecycle.activate(&rec.cookie).await.is_err());
        h.lifecycle.remove(&rec.cookie).await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_update_rebuilds() {
        let h = harness();
        let rec = h.lifecycle.add(spec("golang")).await.unwrap();
        h.runner.push(Ok(RunResult::failed(1, "")));
        let _ = h
            .lifecycle
            .pod_ready(PodEvent {
                deployment: rec.build_deployment(),
                ready: true,
            })
            .await;
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Stalled);

        let updated = h
            .lifecycle
            .update(
                &rec.cookie,
                FunctionUpdate {
                    version: Some("v2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.state, FunctionState::Building);
        assert!(h.orchestrator.has_deployment(&updated.build_deployment().name()));
    }

    #[tokio::test]
    async fn test_update_switches_serving_version() {
        let h = harness();
        let rec = h.lifecycle.add(spec("python")).await.unwrap();
        ready(&h, rec.run_deployment()).await;

        let updated = h
            .lifecycle
            .update(
                &rec.cookie,
                FunctionUpdate {
                    version: Some("v2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.state, FunctionState::Ready);
        // Old version keeps serving until the new deployment is ready
        assert_eq!(updated.run_deployment().version, "v1");

        let v2 = DeploymentKey::run(rec.cookie.as_str(), "v2");
        ready(&h, v2.clone()).await;
        let info = h.lifecycle.info(&rec.cookie).await.unwrap();
        assert_eq!(info.record.run_version.as_deref(), Some("v2"));
        assert!(!h.orchestrator.has_deployment(&rec.run_deployment().name()));
        assert!(h.balancer.link(&rec.run_deployment()).is_none());
        assert!(h.balancer.link(&v2).is_some());
        h.lifecycle.remove(&rec.cookie).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_of_building_function_rejected() {
        let h = harness();
        let rec = h.lifecycle.add(spec("golang")).await.unwrap();
        let err = h
            .lifecycle
            .update(
                &rec.cookie,
                FunctionUpdate {
                    version: Some("v2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), 409);
    }

    #[tokio::test]
    async fn test_size_update_reconfigures_limiter() {
        let h = harness();
        let rec = h.lifecycle.add(spec("python")).await.unwrap();
        ready(&h, rec.run_deployment()).await;
        let rt = h.lifecycle.registry().runtime(&rec.cookie).await.unwrap();
        assert!(rt.limiter().is_none());

        h.lifecycle
            .update(
                &rec.cookie,
                FunctionUpdate {
                    size: Some(FunctionSize {
                        rate: 3,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let limiter = rt.limiter().unwrap();
        assert_eq!((limiter.rate(), limiter.burst()), (3, 3));
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Ready);
        h.lifecycle.remove(&rec.cookie).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_only_from_removable_states() {
        let h = harness();
        let rec = h.lifecycle.add(spec("golang")).await.unwrap();
        let err = h.lifecycle.remove(&rec.cookie).await.unwrap_err();
        assert!(matches!(err, GateError::InvalidState(_)));
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Building);
    }

    #[tokio::test]
    async fn test_remove_drains_stats_and_purges() {
        let h = harness();
        let rec = h.lifecycle.add(spec("python")).await.unwrap();
        ready(&h, rec.run_deployment()).await;
        let rt = h.lifecycle.registry().runtime(&rec.cookie).await.unwrap();
        rt.stats().record(&CallRecord {
            outcome: CallOutcome::Ok,
            run_time_us: 10,
            call_time_us: 20,
            bytes_in: 1,
            bytes_out: 2,
        });

        h.lifecycle.remove(&rec.cookie).await.unwrap();
        assert_eq!(h.stats_store.get(&rec.cookie).unwrap().called, 1);
        assert!(h.store.get(&rec.cookie).await.is_err());
        assert!(h.lifecycle.registry().loaded(&rec.cookie).is_none());
        assert!(h.orchestrator.deployment_names().is_empty());
        assert_eq!(rt.scaler_state().goal, 0);
    }

    #[tokio::test]
    async fn test_add_rolls_back_on_orchestrator_failure() {
        let h = harness();
        h.orchestrator.set_failing(true);
        assert!(h.lifecycle.add(spec("python")).await.is_err());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_add_validates() {
        let h = harness();
        let mut bad = spec("cobol");
        assert!(matches!(
            h.lifecycle.add(bad.clone()).await,
            Err(GateError::Config(_))
        ));
        bad.lang = "python".into();
        bad.name = "a/b".into();
        assert_eq!(h.lifecycle.add(bad).await.unwrap_err().status(), 400);
    }

    #[tokio::test]
    async fn test_deactivate_and_activate() {
        let h = harness();
        let rec = h.lifecycle.add(spec("python")).await.unwrap();
        ready(&h, rec.run_deployment()).await;

        h.lifecycle.deactivate(&rec.cookie).await.unwrap();
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Deactivated);
        assert_eq!(h.orchestrator.replicas(&rec.run_deployment().name()), 0);
        let rt = h.lifecycle.registry().runtime(&rec.cookie).await.unwrap();
        assert_eq!(rt.scaler_state().goal, 0);

        h.lifecycle.activate(&rec.cookie).await.unwrap();
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Ready);
        assert_eq!(rt.scaler_state().goal, 2);
        h.lifecycle.remove(&rec.cookie).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_persist_retries() {
        let h = harness();
        let rec = h.lifecycle.add(spec("golang")).await.unwrap();
        h.runner.push(Ok(RunResult::failed(2, "")));
        h.store.set_failing(true);
        let result = h
            .lifecycle
            .pod_ready(PodEvent {
                deployment: rec.build_deployment(),
                ready: true,
            })
            .await;
        assert!(result.is_err());
        h.store.set_failing(false);
        // The store never took the write, but calls already see the stall
        assert_eq!(state(&h, &rec.cookie).await, FunctionState::Building);
        let rt = h.lifecycle.registry().loaded(&rec.cookie).unwrap();
        assert_eq!(rt.record().state, FunctionState::Stalled);
    }

    #[tokio::test]
    async fn test_resume_restarts_scaling() {
        let h = harness();
        let rec = h.lifecycle.add(spec("python")).await.unwrap();
        ready(&h, rec.run_deployment()).await;
        let rt = h.lifecycle.registry().runtime(&rec.cookie).await.unwrap();
        h.lifecycle.autoscaler.stop(&rt);
        h.lifecycle.registry().evict(&rec.cookie);

        assert_eq!(h.lifecycle.resume().await.unwrap(), 1);
        let rt = h.lifecycle.registry().runtime(&rec.cookie).await.unwrap();
        assert_eq!(rt.scaler_state().goal, 2);
        h.lifecycle.remove(&rec.cookie).await.unwrap();
    }
}
