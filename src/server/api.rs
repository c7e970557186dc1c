//! Management API — functions and their logs, pod events, settings, health, metrics

use http::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::ServerState;
use crate::error::{GateError, Result};
use crate::lifecycle::{FunctionSpec, FunctionUpdate, PodEvent};

/// Response of a management endpoint
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: serde_json::to_string_pretty(value).unwrap_or_default(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: String::new(),
        }
    }

    pub fn error(err: &GateError) -> Self {
        Self {
            status: err.status(),
            content_type: "application/json".to_string(),
            body: err.to_body(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SettingValue {
    value: u64,
}

fn parse<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| GateError::BadRequest(format!("invalid body: {}", e)))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Serve `/health`, `/metrics` and everything under `/v1`
pub async fn handle(
    state: &Arc<ServerState>,
    method: &Method,
    segments: &[&str],
    query: Option<&str>,
    body: &[u8],
) -> ApiResponse {
    match route(state, method, segments, query, body).await {
        Ok(resp) => resp,
        Err(e) => {
            if e.is_internal() {
                tracing::error!(path = %segments.join("/"), error = %e, "Management request failed");
            }
            ApiResponse::error(&e)
        }
    }
}

async fn route(
    state: &Arc<ServerState>,
    method: &Method,
    segments: &[&str],
    query: Option<&str>,
    body: &[u8],
) -> Result<ApiResponse> {
    let lifecycle = &state.lifecycle;

    match (method, segments) {
        (&Method::GET, ["health"]) => Ok(ApiResponse::json(200, &state.health())),
        (&Method::GET, ["metrics"]) => Ok(ApiResponse {
            status: 200,
            content_type: "text/plain; version=0.0.4".to_string(),
            body: state.dispatcher.metrics().render_prometheus(),
        }),

        (&Method::POST, ["v1", "functions"]) => {
            let spec: FunctionSpec = parse(body)?;
            let record = lifecycle.add(spec).await?;
            Ok(ApiResponse::json(201, &record))
        }
        (&Method::GET, ["v1", "functions"]) => {
            let tenant = query_param(query, "tenant");
            let records = lifecycle.list(tenant.as_deref()).await?;
            Ok(ApiResponse::json(200, &records))
        }
        (&Method::GET, ["v1", "functions", cookie]) => {
            Ok(ApiResponse::json(200, &lifecycle.info(cookie).await?))
        }
        (&Method::PUT, ["v1", "functions", cookie]) => {
            let update: FunctionUpdate = parse(body)?;
            Ok(ApiResponse::json(200, &lifecycle.update(cookie, update).await?))
        }
        (&Method::DELETE, ["v1", "functions", cookie]) => {
            lifecycle.remove(cookie).await?;
            state.dispatcher.metrics().forget_function(cookie);
            Ok(ApiResponse::empty(204))
        }
        (&Method::POST, ["v1", "functions", cookie, "deactivate"]) => {
            Ok(ApiResponse::json(200, &lifecycle.deactivate(cookie).await?))
        }
        (&Method::POST, ["v1", "functions", cookie, "activate"]) => {
            Ok(ApiResponse::json(200, &lifecycle.activate(cookie).await?))
        }
        (&Method::GET, ["v1", "functions", cookie, "stats"]) => {
            let rt = lifecycle.registry().runtime(cookie).await?;
            Ok(ApiResponse::json(200, &rt.stats().snapshot()))
        }
        (&Method::GET, ["v1", "functions", cookie, "logs"]) => {
            let rt = lifecycle.registry().runtime(cookie).await?;
            Ok(ApiResponse::json(200, &rt.logs().entries()))
        }

        (&Method::POST, ["v1", "pods"]) => {
            let event: PodEvent = parse(body)?;
            // Builds can take as long as a run request; answer right away
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                let deployment = event.deployment.clone();
                if let Err(e) = lifecycle.pod_ready(event).await {
                    tracing::error!(deployment = %deployment, error = %e, "Pod event handling failed");
                }
            });
            Ok(ApiResponse::empty(202))
        }

        (&Method::GET, ["v1", "settings"]) => {
            let settings: BTreeMap<&str, u64> = state.settings.list().into_iter().collect();
            Ok(ApiResponse::json(200, &settings))
        }
        (&Method::GET, ["v1", "settings", name]) => {
            let value = state
                .settings
                .get(name)
                .ok_or_else(|| GateError::NotFound(format!("setting '{}'", name)))?;
            Ok(ApiResponse::json(200, &serde_json::json!({ "value": value })))
        }
        (&Method::PUT, ["v1", "settings", name]) => {
            let SettingValue { value } = parse(body)?;
            state.settings.set(name, value)?;
            state.apply_settings();
            Ok(ApiResponse::json(200, &serde_json::json!({ "value": value })))
        }

        _ => Err(GateError::NotFound(format!("no route for {} /{}", method, segments.join("/")))),
    }
}
