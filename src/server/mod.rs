//! HTTP server — the call path and the management API on one listener
//!
//! `/call/{id}/...` goes to the dispatcher, `/v1/functions/{id}/tryrun/{version}/...`
//! to the try-run path, everything else to [`api`].

pub mod api;
pub mod cors;

pub use api::ApiResponse;
pub use cors::{CorsPolicy, Preflight};

use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::net::TcpListener;

use crate::admission::AdmissionControl;
use crate::config::Settings;
use crate::dispatch::{CallResponse, Dispatcher, InboundCall};
use crate::error::{GateError, Result};
use crate::lifecycle::Lifecycle;
use crate::{GateState, HealthStatus};

type HttpResponse = hyper::Response<Full<Bytes>>;

/// Header carrying the management API key
pub const ADMIN_KEY_HEADER: &str = "x-api-key";

/// Shared state for request handling
pub struct ServerState {
    pub dispatcher: Arc<Dispatcher>,
    pub lifecycle: Arc<Lifecycle>,
    pub admission: Arc<AdmissionControl>,
    pub settings: Arc<Settings>,
    cors: RwLock<Arc<CorsPolicy>>,
    admin_keys: RwLock<Arc<Vec<String>>>,
    state: RwLock<GateState>,
    started: Instant,
}

impl ServerState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        lifecycle: Arc<Lifecycle>,
        admission: Arc<AdmissionControl>,
        settings: Arc<Settings>,
        cors: CorsPolicy,
    ) -> Self {
        Self {
            dispatcher,
            lifecycle,
            admission,
            settings,
            cors: RwLock::new(Arc::new(cors)),
            admin_keys: RwLock::new(Arc::new(Vec::new())),
            state: RwLock::new(GateState::Created),
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> GateState {
        self.state.read().unwrap().clone()
    }

    pub fn set_state(&self, state: GateState) {
        tracing::debug!(state = %state, "Gate state changed");
        *self.state.write().unwrap() = state;
    }

    pub fn cors(&self) -> Arc<CorsPolicy> {
        self.cors.read().unwrap().clone()
    }

    pub fn set_cors(&self, cors: CorsPolicy) {
        *self.cors.write().unwrap() = Arc::new(cors);
    }

    /// Keys accepted on the management API; empty leaves it open
    pub fn set_admin_keys(&self, keys: Vec<String>) {
        *self.admin_keys.write().unwrap() = Arc::new(keys);
    }

    fn authorize_admin(&self, headers: &http::HeaderMap) -> Result<()> {
        let keys = self.admin_keys.read().unwrap().clone();
        if keys.is_empty() {
            return Ok(());
        }
        match headers.get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            Some(key) if keys.iter().any(|k| k == key) => Ok(()),
            Some(_) => Err(GateError::Unauthorized("invalid API key".to_string())),
            None => Err(GateError::Unauthorized("missing API key".to_string())),
        }
    }

    /// Push the current limiter settings into the live limiters
    pub fn apply_settings(&self) {
        let (rate, burst) = self.settings.global_limit();
        self.admission.set_global(rate, burst);
        self.lifecycle.registry().refresh_limits();
    }

    pub fn health(&self) -> HealthStatus {
        let metrics = self.dispatcher.metrics();
        HealthStatus {
            state: self.state(),
            uptime_secs: self.started.elapsed().as_secs(),
            active_calls: metrics.active_calls().max(0) as u64,
            total_calls: metrics.total_calls(),
            functions_loaded: self.lifecycle.registry().loaded_runtimes().len(),
        }
    }
}

/// Where a request goes
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Call { cookie: &'a str, rest: &'a str },
    TryRun { cookie: &'a str, version: &'a str, rest: &'a str },
    Api,
}

/// First `n` non-empty segments of `path` and the remainder (empty or starting with '/')
fn split_segments(path: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut segments = Vec::with_capacity(n);
    let mut rest = path;
    for _ in 0..n {
        let tail = rest.strip_prefix('/')?;
        let end = tail.find('/').unwrap_or(tail.len());
        if end == 0 {
            return None;
        }
        segments.push(&tail[..end]);
        rest = &tail[end..];
    }
    Some((segments, rest))
}

fn route(path: &str) -> Route<'_> {
    if let Some((segments, rest)) = split_segments(path, 2) {
        if segments[0] == "call" {
            return Route::Call {
                cookie: segments[1],
                rest,
            };
        }
    }
    if let Some((segments, rest)) = split_segments(path, 5) {
        if segments[..2] == ["v1", "functions"] && segments[3] == "tryrun" {
            return Route::TryRun {
                cookie: segments[2],
                version: segments[4],
                rest,
            };
        }
    }
    Route::Api
}

/// Start the listener; returns the bound address and the accept-loop task
pub async fn start(
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| GateError::Other(format!("Failed to bind {}: {}", addr, e)))?;
    let local = listener.local_addr()?;

    tracing::info!(address = %local, "HTTP server listening");

    let handle = tokio::spawn(async move {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let state = state.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                if let Err(e) = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(|req| handle_http_request(req, state.clone())),
                    )
                    .await
                {
                    tracing::debug!(remote = %remote_addr, error = %e, "Connection closed with error");
                }
            });
        }
    });

    Ok((local, handle))
}

/// Handle an individual HTTP request
async fn handle_http_request(
    req: hyper::Request<Incoming>,
    state: Arc<ServerState>,
) -> std::result::Result<HttpResponse, hyper::Error> {
    Ok(serve(req, state).await)
}

async fn serve<B>(req: hyper::Request<B>, state: Arc<ServerState>) -> HttpResponse
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|q| q.to_string());

    let body_bytes = match http_body_util::BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let err = GateError::BadRequest(format!("failed to read request body: {}", e));
            return error_response(&path, &err);
        }
    };

    if CorsPolicy::is_preflight(&parts.method, &parts.headers) {
        return match state.cors().preflight(&parts.headers) {
            Preflight::Allowed(headers) => {
                let mut resp = plain(StatusCode::NO_CONTENT.as_u16(), "text/plain", Bytes::new());
                resp.headers_mut().extend(headers);
                resp
            }
            Preflight::Forbidden => plain(403, "text/plain", Bytes::from("Forbidden")),
        };
    }

    let result = match route(&path) {
        Route::Call { cookie, rest } => {
            let call = inbound(&parts, rest, query.as_deref(), body_bytes);
            state.dispatcher.call_isolated(cookie.to_string(), call).await
        }
        Route::TryRun {
            cookie,
            version,
            rest,
        } => match state.authorize_admin(&parts.headers) {
            Ok(()) => {
                let call = inbound(&parts, rest, query.as_deref(), body_bytes);
                state
                    .dispatcher
                    .try_run_isolated(cookie.to_string(), version.to_string(), call)
                    .await
            }
            Err(e) => Err(e),
        },
        Route::Api => {
            let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
            // Health checks and metric scrapers stay open
            let open = matches!(segments.as_slice(), ["health"] | ["metrics"]);
            if !open {
                if let Err(e) = state.authorize_admin(&parts.headers) {
                    return error_response(&path, &e);
                }
            }
            let resp =
                api::handle(&state, &parts.method, &segments, query.as_deref(), &body_bytes).await;
            return plain(resp.status, &resp.content_type, Bytes::from(resp.body));
        }
    };

    let mut resp = match result {
        Ok(CallResponse { status, body }) => plain(status, "text/plain; charset=utf-8", Bytes::from(body)),
        Err(e) => error_response(&path, &e),
    };
    state.cors().apply(&parts.headers, resp.headers_mut());
    resp
}

fn inbound(parts: &http::request::Parts, rest: &str, query: Option<&str>, body: Bytes) -> InboundCall {
    let mut call = InboundCall::new(parts.method.clone(), rest);
    if let Some(query) = query {
        call = call.with_query(query);
    }
    call.headers = parts.headers.clone();
    call.body = body;
    call
}

fn error_response(path: &str, err: &GateError) -> HttpResponse {
    if err.is_internal() {
        tracing::error!(path, error = %err, "Call failed");
    } else {
        tracing::debug!(path, error = %err, "Call rejected");
    }
    match err {
        GateError::RunnerFailure { .. } => plain(
            err.status(),
            "text/plain; charset=utf-8",
            Bytes::from(err.client_message()),
        ),
        _ => plain(err.status(), "application/json", Bytes::from(err.to_body())),
    }
}

fn plain(status: u16, content_type: &str, body: Bytes) -> HttpResponse {
    let mut resp = hyper::Response::new(Full::new(body));
    *resp.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if let Ok(v) = content_type.parse() {
        resp.headers_mut().insert(http::header::CONTENT_TYPE, v);
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use crate::balancer::Balancer;
    use crate::config::GateConfig;
    use crate::dispatch::{ClaimsVerifier, MockRunner};
    use crate::registry::{FunctionRegistry, MemoryFunctionStore};
    use crate::scaling::autoscaler::Autoscaler;
    use crate::scaling::orchestrator::MockOrchestrator;
    use crate::stats::{MemoryStatsStore, StatsRecorder};

    fn server_state() -> Arc<ServerState> {
        let config = GateConfig::default();
        let settings = Arc::new(Settings::from_config(&config));
        let orchestrator = Arc::new(MockOrchestrator::new());
        let stats = Arc::new(StatsRecorder::new(Arc::new(MemoryStatsStore::new())));
        let registry = Arc::new(FunctionRegistry::new(
            Arc::new(MemoryFunctionStore::new()),
            &config.runtime,
            settings.clone(),
            stats.clone(),
        ));
        let balancer = Arc::new(Balancer::new(orchestrator.clone()));
        let autoscaler = Arc::new(Autoscaler::new(orchestrator.clone(), settings.clone()));
        let admission = Arc::new(AdmissionControl::new(0, 0));
        let runner = Arc::new(MockRunner::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            balancer.clone(),
            autoscaler.clone(),
            admission.clone(),
            runner.clone(),
            ClaimsVerifier::empty(),
            settings.clone(),
            Arc::new(crate::observability::GateMetrics::default()),
        ));
        let lifecycle = Arc::new(Lifecycle::new(
            registry,
            balancer,
            autoscaler,
            orchestrator,
            runner,
            stats,
        ));
        Arc::new(ServerState::new(
            dispatcher,
            lifecycle,
            admission,
            settings,
            CorsPolicy::default(),
        ))
    }

    #[test]
    fn test_route_call() {
        assert_eq!(
            route("/call/abc"),
            Route::Call {
                cookie: "abc",
                rest: ""
            }
        );
        assert_eq!(
            route("/call/abc/users/7"),
            Route::Call {
                cookie: "abc",
                rest: "/users/7"
            }
        );
        assert_eq!(route("/call/"), Route::Api);
        assert_eq!(route("/calls/abc"), Route::Api);
    }

    #[test]
    fn test_route_tryrun() {
        assert_eq!(
            route("/v1/functions/abc/tryrun/v2"),
            Route::TryRun {
                cookie: "abc",
                version: "v2",
                rest: ""
            }
        );
        assert_eq!(
            route("/v1/functions/abc/tryrun/v2/x"),
            Route::TryRun {
                cookie: "abc",
                version: "v2",
                rest: "/x"
            }
        );
        assert_eq!(route("/v1/functions/abc/stats"), Route::Api);
        assert_eq!(route("/v1/functions/abc/activate/v2"), Route::Api);
    }

    #[test]
    fn test_error_response_shapes() {
        let resp = error_response(
            "/call/x",
            &GateError::RunnerFailure {
                code: 404,
                message: "no such user".into(),
            },
        );
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.headers()[http::header::CONTENT_TYPE], "text/plain; charset=utf-8");

        let resp = error_response("/call/x", &GateError::RateLimited("tenant".into()));
        assert_eq!(resp.status(), 429);
        assert_eq!(resp.headers()[http::header::CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_health_and_settings() {
        let state = server_state();
        state.set_state(GateState::Running);
        let health = state.health();
        assert_eq!(health.state, GateState::Running);
        assert_eq!(health.functions_loaded, 0);
        assert_eq!(health.total_calls, 0);

        let resp = api::handle(
            &state,
            &Method::PUT,
            &["v1", "settings", "global_rate"],
            None,
            br#"{"value": 5}"#,
        )
        .await;
        assert_eq!(resp.status, 200);
        let limiter = state.admission.global().unwrap();
        assert_eq!(limiter.rate(), 5);

        let resp = api::handle(
            &state,
            &Method::PUT,
            &["v1", "settings", "no_such_knob"],
            None,
            br#"{"value": 5}"#,
        )
        .await;
        assert_eq!(resp.status, 404);
    }

    struct BrokenBody;

    impl hyper::body::Body for BrokenBody {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<std::result::Result<hyper::body::Frame<Bytes>, Self::Error>>>
        {
            std::task::Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "peer went away",
            ))))
        }
    }

    fn request(method: Method, uri: &str, key: Option<&str>) -> hyper::Request<Full<Bytes>> {
        let mut builder = hyper::Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(ADMIN_KEY_HEADER, key);
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    #[tokio::test]
    async fn test_unreadable_body_is_bad_request() {
        let state = server_state();
        let req = hyper::Request::builder()
            .method(Method::POST)
            .uri("/v1/functions")
            .body(BrokenBody)
            .unwrap();
        let resp = serve(req, state).await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_management_requires_api_key() {
        let state = server_state();
        state.set_admin_keys(vec!["ops-key".to_string()]);

        let resp = serve(request(Method::GET, "/v1/functions", None), state.clone()).await;
        assert_eq!(resp.status(), 401);
        let resp = serve(request(Method::GET, "/v1/functions", Some("guess")), state.clone()).await;
        assert_eq!(resp.status(), 401);
        let resp = serve(request(Method::GET, "/v1/functions", Some("ops-key")), state.clone()).await;
        assert_eq!(resp.status(), 200);

        let resp = serve(request(Method::GET, "/v1/functions/abc/tryrun/v1", None), state.clone()).await;
        assert_eq!(resp.status(), 401);

        let resp = serve(request(Method::GET, "/health", None), state.clone()).await;
        assert_eq!(resp.status(), 200);
        // The call path never asks for the key
        let resp = serve(request(Method::GET, "/call/abc", None), state.clone()).await;
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_api_open_without_keys() {
        let state = server_state();
        let resp = serve(request(Method::GET, "/v1/settings", None), state).await;
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_api_function_lifecycle() {
        let state = server_state();
        let body = br#"{"tenant":"acme","project":"shop","name":"cart","lang":"python","version":"v1"}"#;
        let resp = api::handle(&state, &Method::POST, &["v1", "functions"], None, body).await;
        assert_eq!(resp.status, 201, "{}", resp.body);
        let record: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        let cookie = record["cookie"].as_str().unwrap().to_string();

        let resp = api::handle(
            &state,
            &Method::GET,
            &["v1", "functions"],
            Some("tenant=acme"),
            b"",
        )
        .await;
        assert_eq!(resp.status, 200);
        let list: Vec<serde_json::Value> = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(list.len(), 1);

        let resp = api::handle(
            &state,
            &Method::GET,
            &["v1", "functions", &cookie, "stats"],
            None,
            b"",
        )
        .await;
        assert_eq!(resp.status, 200);

        let rt = state.lifecycle.registry().runtime(&cookie).await.unwrap();
        rt.logs().push("tok-1", "started\n", "");
        let resp = api::handle(
            &state,
            &Method::GET,
            &["v1", "functions", &cookie, "logs"],
            None,
            b"",
        )
        .await;
        assert_eq!(resp.status, 200);
        let logs: Vec<serde_json::Value> = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["token"], "tok-1");
        assert_eq!(logs[0]["stdout"], "started\n");

        let resp = api::handle(&state, &Method::GET, &["v1", "functions", "nope", "logs"], None, b"").await;
        assert_eq!(resp.status, 404);

        let resp = api::handle(&state, &Method::GET, &["v1", "functions", "nope"], None, b"").await;
        assert_eq!(resp.status, 404);
    }
}
