// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP routes.
//!
//! | Method & Path | Purpose |
//! |---------------|---------|
//! | `PUT /_admin/{func_name}/recompile` | Deploy a zip bundle as `func_name` |
//! | `GET /_admin/functions` | List registered functions |
//! | `GET /_health/check` | Router liveness |
//! | any `/{func_name}[/...]` | Invoke: proxied to the function's instance |
//!
//! The router keeps no per-function state. Everything goes through the
//! [`Deployer`] and the registry behind it.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use fnhost_core::{Deployer, FunctionRegistry, InstanceState};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    deployer: Deployer,
    registry: Arc<FunctionRegistry>,
    readiness_timeout: Duration,
}

impl AppState {
    /// Create handler state. Invocations of a starting instance wait up to
    /// `readiness_timeout` before answering 503.
    pub fn new(deployer: Deployer, readiness_timeout: Duration) -> Self {
        Self {
            registry: deployer.registry().clone(),
            deployer,
            readiness_timeout,
        }
    }
}

/// Build the router. Uploads above `max_upload_bytes` are refused with 413.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route(
            "/_admin/{func_name}/recompile",
            put(recompile).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/_admin/functions", get(list_functions))
        .route("/_health/check", get(health_check))
        .fallback(invoke)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn recompile(
    State(state): State<AppState>,
    Path(func_name): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    info!(function = %func_name, bytes = body.len(), "Recompiling function");

    let deployment = state
        .deployer
        .deploy(&func_name, body)
        .await
        .inspect_err(|e| warn!(function = %func_name, error = %e, "Recompile failed"))?;

    info!(
        function = %func_name,
        instance_id = %deployment.instance.id(),
        build_ms = deployment.build.duration.as_millis() as u64,
        "Recompile succeeded"
    );
    Ok(Json(json!({ "status": "ok", "funcName": func_name })))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionSummary {
    name: String,
    instance_id: String,
    state: InstanceState,
    pid: Option<u32>,
    address: Option<String>,
    started_at: DateTime<Utc>,
}

async fn list_functions(State(state): State<AppState>) -> impl IntoResponse {
    let functions: Vec<FunctionSummary> = state
        .registry
        .instances()
        .iter()
        .map(|instance| FunctionSummary {
            name: instance.name().to_string(),
            instance_id: instance.id().to_string(),
            state: instance.state(),
            pid: instance.pid(),
            address: instance.bound_addr().map(|a| a.to_string()),
            started_at: instance.started_at(),
        })
        .collect();
    Json(json!({ "functions": functions }))
}

/// First path segment, the function name: `/hello/a?b` -> `hello`.
fn function_name(path: &str) -> Option<&str> {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .filter(|name| !name.is_empty())
}

async fn invoke(State(state): State<AppState>, req: Request) -> Result<Response, ApiError> {
    let Some(name) = function_name(req.uri().path()) else {
        return Err(ApiError::NotFound);
    };
    let Some(instance) = state.registry.lookup(name) else {
        debug!(function = %name, "Invocation of unknown function");
        return Err(ApiError::NotFound);
    };

    let proxy = match instance.wait_ready(state.readiness_timeout).await {
        Ok(proxy) => proxy,
        Err(reason) => {
            warn!(function = %instance.name(), %reason, "Function not ready");
            return Err(ApiError::NotReady);
        }
    };

    proxy.forward(req).await.map_err(|e| {
        warn!(
            function = %instance.name(),
            error = %e,
            connect = e.is_connect(),
            "Proxy request failed"
        );
        ApiError::BadGateway
    })
}
