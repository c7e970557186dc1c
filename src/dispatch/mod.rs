//! Invocation dispatcher — one call from admission to stats
//!
//! A call passes the layered rate limiters, then the quota check, then
//! leases a connection on the function's serving deployment and forwards a
//! run request to the pod. The lease is a guard: it is released on every
//! exit path, including timeouts and runner panics.

pub mod claims;
pub mod request;
pub mod runner;

pub use claims::ClaimsVerifier;
pub use request::{build_run_request, InboundCall};
pub use runner::{HttpRunner, MockRunner, RunRequest, RunResult, Runner};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::time::Instant;

use crate::admission::{check_quota, AdmissionControl, RateLimiter};
use crate::balancer::{Balancer, Lease, Lookup};
use crate::config::Settings;
use crate::error::{GateError, Result};
use crate::observability::GateMetrics;
use crate::registry::{DeploymentKey, FunctionRegistry, FunctionRuntime, FunctionState};
use crate::scaling::autoscaler::Autoscaler;
use crate::stats::{CallOutcome, CallRecord};

/// Successful answer of a function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub status: u16,
    pub body: String,
}

/// Routes calls to function pods
pub struct Dispatcher {
    registry: Arc<FunctionRegistry>,
    balancer: Arc<Balancer>,
    autoscaler: Arc<Autoscaler>,
    admission: Arc<AdmissionControl>,
    runner: Arc<dyn Runner>,
    verifier: RwLock<Arc<ClaimsVerifier>>,
    settings: Arc<Settings>,
    metrics: Arc<GateMetrics>,
    tryrun: RateLimiter,
    sequence: AtomicU64,
}

/// States in which a specific version may still be called
fn accepts_try_run(state: FunctionState) -> bool {
    !matches!(state, FunctionState::Terminating | FunctionState::Deactivated)
}

/// Keeps the active-calls gauge balanced, even when the runner panics
struct ActiveCall<'a>(&'a GateMetrics);

impl<'a> ActiveCall<'a> {
    fn enter(metrics: &'a GateMetrics) -> Self {
        metrics.inc_active();
        Self(metrics)
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.dec_active();
    }
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<FunctionRegistry>,
        balancer: Arc<Balancer>,
        autoscaler: Arc<Autoscaler>,
        admission: Arc<AdmissionControl>,
        runner: Arc<dyn Runner>,
        verifier: ClaimsVerifier,
        settings: Arc<Settings>,
        metrics: Arc<GateMetrics>,
    ) -> Self {
        let rate = settings.tryrun_rate().max(1);
        Self {
            registry,
            balancer,
            autoscaler,
            admission,
            runner,
            verifier: RwLock::new(Arc::new(verifier)),
            settings,
            metrics,
            tryrun: RateLimiter::new(rate, rate),
            sequence: AtomicU64::new(0),
        }
    }

    /// Swap the auth-context secrets (config reload)
    pub fn set_verifier(&self, verifier: ClaimsVerifier) {
        *self.verifier.write().unwrap() = Arc::new(verifier);
    }

    fn verifier(&self) -> Arc<ClaimsVerifier> {
        self.verifier.read().unwrap().clone()
    }

    pub fn metrics(&self) -> &Arc<GateMetrics> {
        &self.metrics
    }

    /// Call a function's serving deployment
    pub async fn call(&self, cookie: &str, call: InboundCall) -> Result<CallResponse> {
        let result = self.call_inner(cookie, &call).await;
        self.observe(&result);
        result
    }

    async fn call_inner(&self, cookie: &str, call: &InboundCall) -> Result<CallResponse> {
        let rt = self.registry.runtime(cookie).await?;
        let state = rt.state();
        if !state.is_serving() {
            return Err(GateError::Unavailable(format!("function is {}", state)));
        }

        self.admission
            .admit(rt.limiter().as_deref(), rt.tenant().limiter().as_deref())?;
        let (function_quota, tenant_quota) = self.registry.quota_limits();
        check_quota(
            (rt.usage(), function_quota),
            (rt.tenant().usage(), tenant_quota),
        )?;

        let lease = self.balancer.acquire(&rt, &Lookup::AnyReady).await?;
        let lease = self.recheck(&rt, lease, FunctionState::is_serving)?;
        self.autoscaler.observe_load(&rt);
        self.forward(&rt, lease, call).await
    }

    /// Call one specific version, e.g. while an update is still building
    pub async fn try_run(
        &self,
        cookie: &str,
        version: &str,
        call: InboundCall,
    ) -> Result<CallResponse> {
        let result = self.try_run_inner(cookie, version, &call).await;
        self.observe(&result);
        result
    }

    async fn try_run_inner(
        &self,
        cookie: &str,
        version: &str,
        call: &InboundCall,
    ) -> Result<CallResponse> {
        let rt = self.registry.runtime(cookie).await?;
        let state = rt.state();
        if !accepts_try_run(state) {
            return Err(GateError::Unavailable(format!("function is {}", state)));
        }

        let rate = self.settings.tryrun_rate();
        if rate > 0 {
            if rate != self.tryrun.rate() {
                self.tryrun.update(rate, rate);
            }
            if !self.tryrun.acquire() {
                tracing::debug!(cookie, "Try-run rejected");
                return Err(GateError::RateLimited(
                    "try-run rate limit exceeded".to_string(),
                ));
            }
        }

        let key = DeploymentKey::run(cookie, version);
        let lease = self.balancer.acquire(&rt, &Lookup::Exact(key)).await?;
        let lease = self.recheck(&rt, lease, accepts_try_run)?;
        self.forward(&rt, lease, call).await
    }

    /// Check the function again once a lease is held. Acquiring may wait on
    /// the orchestrator, and a removal finishing meanwhile leaves a retired
    /// runtime whose refreshed link must not be used or kept.
    fn recheck(
        &self,
        rt: &FunctionRuntime,
        lease: Lease,
        admits: fn(FunctionState) -> bool,
    ) -> Result<Lease> {
        let retired = rt.scaler_state().retired;
        let state = rt.state();
        if !retired && admits(state) {
            return Ok(lease);
        }

        let key = lease.link().key().clone();
        self.balancer.release_connection(lease);
        if retired || state == FunctionState::Terminating {
            self.balancer.forget_deployment(&key);
        }
        tracing::debug!(cookie = rt.cookie(), state = %state, retired, "Function changed while leasing");
        if retired {
            Err(GateError::NotFound(format!("function {}", rt.cookie())))
        } else {
            Err(GateError::Unavailable(format!("function is {}", state)))
        }
    }

    /// Run `call` in its own task so a panic still yields an answer
    pub async fn call_isolated(
        self: &Arc<Self>,
        cookie: String,
        call: InboundCall,
    ) -> Result<CallResponse> {
        let this = self.clone();
        self.isolate(async move { this.call(&cookie, call).await })
            .await
    }

    pub async fn try_run_isolated(
        self: &Arc<Self>,
        cookie: String,
        version: String,
        call: InboundCall,
    ) -> Result<CallResponse> {
        let this = self.clone();
        self.isolate(async move { this.try_run(&cookie, &version, call).await })
            .await
    }

    async fn isolate<F>(&self, fut: F) -> Result<CallResponse>
    where
        F: Future<Output = Result<CallResponse>> + Send + 'static,
    {
        match tokio::spawn(fut).await {
            Ok(result) => result,
            Err(e) => {
                let err = if e.is_panic() {
                    tracing::error!("Call handler panicked");
                    GateError::Other("call handler panicked".to_string())
                } else {
                    GateError::Other(format!("call handler aborted: {}", e))
                };
                self.observe_error(&err);
                Err(err)
            }
        }
    }

    /// Forward on a leased connection and account for the call
    async fn forward(
        &self,
        rt: &Arc<FunctionRuntime>,
        lease: Lease,
        call: &InboundCall,
    ) -> Result<CallResponse> {
        let started = Instant::now();
        let token = self.next_token();
        let timeout = self.settings.runner_timeout();
        let auth_ctx = rt.record().auth_ctx;

        let result = {
            let _active = ActiveCall::enter(&self.metrics);
            self.run_on(&lease, call, token.clone(), auth_ctx.as_deref(), timeout)
                .await
        };
        self.balancer.release_connection(lease);
        if let Ok(r) = &result {
            rt.logs().push(&token, &r.stdout, &r.stderr);
        }

        let call_time_us = started.elapsed().as_micros() as u64;
        let (outcome, run_time_us, bytes_out) = match &result {
            Ok(r) if r.is_failure() => (
                CallOutcome::Error,
                r.run_time_micros,
                r.return_value.len() as u64,
            ),
            Ok(r) => (CallOutcome::Ok, r.run_time_micros, r.return_value.len() as u64),
            Err(GateError::Timeout(_)) => (CallOutcome::Timeout, 0, 0),
            Err(_) => (CallOutcome::Error, 0, 0),
        };
        self.registry.stats().record(
            rt.stats(),
            &CallRecord {
                outcome,
                run_time_us,
                call_time_us,
                bytes_in: call.size(),
                bytes_out,
            },
        );
        rt.usage().add(run_time_us, bytes_out);
        rt.tenant().usage().add(run_time_us, bytes_out);
        self.metrics.record_function_call(rt.cookie(), call_time_us);

        let result = result?;
        if result.is_failure() {
            tracing::debug!(
                cookie = rt.cookie(),
                code = result.return_code,
                "Runner reported failure"
            );
            return Err(GateError::RunnerFailure {
                code: result.status(),
                message: result.return_value,
            });
        }
        Ok(CallResponse {
            status: result.status(),
            body: result.return_value,
        })
    }

    async fn run_on(
        &self,
        lease: &Lease,
        call: &InboundCall,
        token: String,
        auth_ctx: Option<&str>,
        timeout: std::time::Duration,
    ) -> Result<RunResult> {
        let claims = match auth_ctx {
            Some(ctx) => Some(self.verifier().verify(ctx, &call.headers)?),
            None => None,
        };
        let request = build_run_request(call, token, claims)?;

        match tokio::time::timeout(timeout, self.runner.run(lease.address(), &request)).await {
            Ok(Err(GateError::Http(e))) if e.is_timeout() => {
                Err(GateError::Timeout(timeout.as_millis() as u64))
            }
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(address = lease.address(), "Run request timed out");
                Err(GateError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    fn next_token(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{:x}-{:04x}", chrono::Utc::now().timestamp_millis(), seq)
    }

    fn observe(&self, result: &Result<CallResponse>) {
        match result {
            Ok(resp) => self.metrics.record_status(resp.status),
            Err(e) => self.observe_error(e),
        }
    }

    fn observe_error(&self, err: &GateError) {
        self.metrics.record_status(err.status());
        self.metrics.record_error(err.code());
    }
}
