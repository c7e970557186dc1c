//! Gate orchestrator — high-level coordinator for all components
//!
//! Wires the registry, balancer, autoscaler, dispatcher and lifecycle
//! together from one [`GateConfig`], runs the background tasks, and applies
//! hot reloads.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::admission::AdmissionControl;
use crate::balancer::Balancer;
use crate::config::{GateConfig, Settings};
use crate::dispatch::{ClaimsVerifier, Dispatcher, HttpRunner, Runner};
use crate::error::{GateError, Result};
use crate::lifecycle::Lifecycle;
use crate::observability::GateMetrics;
use crate::registry::{FunctionRegistry, MemoryFunctionStore};
use crate::scaling::autoscaler::Autoscaler;
use crate::scaling::orchestrator::{BoxOrchestrator, MockOrchestrator, Orchestrator};
use crate::server::{self, CorsPolicy, ServerState};
use crate::stats::{MemoryStatsStore, StatsRecorder};
use crate::{GateState, HealthStatus};

/// The FaaS gate
pub struct Gate {
    config: RwLock<GateConfig>,
    settings: Arc<Settings>,
    registry: Arc<FunctionRegistry>,
    stats: Arc<StatsRecorder>,
    server: Arc<ServerState>,
    shutdown: AtomicBool,
    local_addr: RwLock<Option<SocketAddr>>,
    /// Listener task
    handles: RwLock<Vec<JoinHandle<()>>>,
    /// Quota window reset task, restarted when the window changes
    quota_task: Mutex<Option<JoinHandle<()>>>,
}

impl Gate {
    /// Build a gate talking to the orchestrator and runners named in `config`
    pub fn new(config: GateConfig) -> Result<Self> {
        let orchestrator: Arc<dyn Orchestrator> = match config.scaling.executor.as_str() {
            "mock" => Arc::new(MockOrchestrator::new()),
            _ => Arc::new(BoxOrchestrator::new(&config.scaling.url)),
        };
        let runner = Arc::new(HttpRunner::new(&config.runner.path, config.runner.port));
        Self::with_parts(config, orchestrator, runner)
    }

    /// Build a gate with explicit orchestrator and runner
    pub fn with_parts(
        config: GateConfig,
        orchestrator: Arc<dyn Orchestrator>,
        runner: Arc<dyn Runner>,
    ) -> Result<Self> {
        config.validate()?;

        let settings = Arc::new(Settings::from_config(&config));
        let stats = Arc::new(StatsRecorder::new(Arc::new(MemoryStatsStore::new())));
        let registry = Arc::new(FunctionRegistry::new(
            Arc::new(MemoryFunctionStore::new()),
            &config.runtime,
            settings.clone(),
            stats.clone(),
        ));
        let balancer = Arc::new(Balancer::new(orchestrator.clone()));
        let autoscaler = Arc::new(Autoscaler::new(orchestrator.clone(), settings.clone()));
        let (rate, burst) = settings.global_limit();
        let admission = Arc::new(AdmissionControl::new(rate, burst));
        let verifier = ClaimsVerifier::new(&config.auth.contexts)?;

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            balancer.clone(),
            autoscaler.clone(),
            admission.clone(),
            runner.clone(),
            verifier,
            settings.clone(),
            Arc::new(GateMetrics::new()),
        ));
        let lifecycle = Arc::new(Lifecycle::new(
            registry.clone(),
            balancer,
            autoscaler,
            orchestrator,
            runner,
            stats.clone(),
        ));
        let server = Arc::new(ServerState::new(
            dispatcher,
            lifecycle,
            admission,
            settings.clone(),
            CorsPolicy::new(&config.cors),
        ));
        server.set_admin_keys(config.auth.admin_keys.clone());

        Ok(Self {
            config: RwLock::new(config),
            settings,
            registry,
            stats,
            server,
            shutdown: AtomicBool::new(false),
            local_addr: RwLock::new(None),
            handles: RwLock::new(Vec::new()),
            quota_task: Mutex::new(None),
        })
    }

    /// Start background tasks, resume serving functions and bind the listener
    pub async fn start(&self) -> Result<()> {
        self.server.set_state(GateState::Starting);
        let config = self.config.read().unwrap().clone();

        self.stats.start(self.settings.clone());
        self.restart_quota_window(config.limits.quota.window_secs);

        match self.server.lifecycle.resume().await {
            Ok(count) => tracing::debug!(count, "Resume finished"),
            Err(e) => tracing::warn!(error = %e, "Failed to resume functions"),
        }

        let addr: SocketAddr = config.listen.parse().map_err(|e| {
            GateError::Config(format!("Invalid listen address '{}': {}", config.listen, e))
        })?;
        let (local, handle) = server::start(addr, self.server.clone()).await?;
        *self.local_addr.write().unwrap() = Some(local);
        self.handles.write().unwrap().push(handle);

        self.server.set_state(GateState::Running);
        tracing::info!(address = %local, "Gate is running");
        Ok(())
    }

    /// Apply a new configuration without restarting. The listen address and
    /// the runtime catalog only change on restart.
    pub async fn reload(&self, new_config: GateConfig) -> Result<()> {
        new_config.validate()?;
        let verifier = ClaimsVerifier::new(&new_config.auth.contexts)?;
        self.server.set_state(GateState::Reloading);
        tracing::info!("Reloading gate configuration");

        let old = self.config.read().unwrap().clone();
        if old.listen != new_config.listen {
            tracing::warn!(
                old = %old.listen,
                new = %new_config.listen,
                "Listen address changes take effect on restart"
            );
        }

        self.settings.apply(&new_config);
        self.server.apply_settings();
        self.server.dispatcher.set_verifier(verifier);
        self.server.set_cors(CorsPolicy::new(&new_config.cors));
        self.server.set_admin_keys(new_config.auth.admin_keys.clone());
        if old.limits.quota.window_secs != new_config.limits.quota.window_secs {
            self.restart_quota_window(new_config.limits.quota.window_secs);
        }

        *self.config.write().unwrap() = new_config;
        self.server.set_state(GateState::Running);
        tracing::info!("Gate configuration reloaded");
        Ok(())
    }

    /// Reset quota usage every `window_secs`; 0 turns the window off
    fn restart_quota_window(&self, window_secs: u64) {
        let mut task = self.quota_task.lock().unwrap();
        if let Some(old) = task.take() {
            old.abort();
        }
        if window_secs == 0 {
            return;
        }

        let registry = self.registry.clone();
        let period = Duration::from_secs(window_secs);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                registry.reset_usage();
            }
        }));
    }

    /// Stop listening and flush stats
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        self.server.set_state(GateState::Stopping);
        tracing::info!("Gate shutting down");

        let handles: Vec<JoinHandle<()>> = self.handles.write().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        if let Some(task) = self.quota_task.lock().unwrap().take() {
            task.abort();
        }

        // Let forwarded calls finish so their stats make the final flush
        let grace = Duration::from_secs(self.config().shutdown_timeout_secs);
        let metrics = self.server.dispatcher.metrics().clone();
        let drained = tokio::time::timeout(grace, async {
            while metrics.active_calls() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                active_calls = metrics.active_calls(),
                "Shutdown timeout reached with calls in flight"
            );
        }

        self.stats.shutdown().await;

        self.server.set_state(GateState::Stopped);
        tracing::info!("Gate stopped");
    }

    /// Wait for Ctrl+C, then shut down
    pub async fn wait_for_shutdown(&self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        self.shutdown().await;
    }

    pub fn state(&self) -> GateState {
        self.server.state()
    }

    pub fn health(&self) -> HealthStatus {
        self.server.health()
    }

    pub fn config(&self) -> GateConfig {
        self.config.read().unwrap().clone()
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.server.lifecycle
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.server.dispatcher
    }

    /// Bound listener address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == GateState::Running
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
