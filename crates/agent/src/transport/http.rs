// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST handlers: health, system info, activity, terminal and agent
//! session listings, and cookie login.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::auth::SESSION_COOKIE;
use crate::error::ErrorCode;
use crate::state::AppState;
use crate::transport::auth::AuthContext;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub sessions: usize,
    pub agent_sessions: usize,
}

/// `GET /health` (no auth).
pub async fn health(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "running".to_owned(),
        uptime_secs: s.started_at.elapsed().as_secs(),
        sessions: s.manager.session_count().await,
        agent_sessions: s.hosts.count().await,
    })
}

/// `GET /api/system-info`
pub async fn system_info(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    match s.sysinfo.collect().await {
        Ok(info) => Json(info).into_response(),
        Err(e) => ErrorCode::Internal
            .to_http_response(format!("system info collection failed: {e}"))
            .into_response(),
    }
}

/// `GET /api/quick-metrics` — the heartbeat-enrichment subset.
pub async fn quick_metrics(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    match s.sysinfo.quick_metrics() {
        Some(metrics) => Json(metrics).into_response(),
        None => ErrorCode::Internal.to_http_response("procfs unavailable").into_response(),
    }
}

/// `POST /api/activity` — explicit activity ping from the frontend.
pub async fn record_activity(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    s.idle.record_activity();
    Json(serde_json::json!({ "recorded": true }))
}

// -- Terminal sessions --------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SessionListQuery {
    /// Restrict to one user's sessions.
    pub user: Option<String>,
}

/// `GET /api/sessions`
pub async fn list_sessions(
    State(s): State<Arc<AppState>>,
    Query(query): Query<SessionListQuery>,
) -> impl IntoResponse {
    Json(s.manager.active_infos(query.user.as_deref()).await)
}

/// `DELETE /api/sessions/{id}`
pub async fn close_session(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match s.manager.close_session(&id).await {
        Ok(()) => Json(serde_json::json!({ "id": id, "closed": true })).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

/// `PUT /api/sessions/{id}/name`
pub async fn rename_session(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> impl IntoResponse {
    match s.manager.set_session_name(&id, &req.name).await {
        Ok(()) => Json(serde_json::json!({ "id": id, "name": req.name })).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

// -- Agent sessions -----------------------------------------------------------

/// `GET /api/agent-sessions`
pub async fn list_agent_sessions(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(s.hosts.list().await)
}

/// `DELETE /api/agent-sessions/{id}`
pub async fn stop_agent_session(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match s.hosts.remove(&id).await {
        Some(host) => {
            host.stop();
            Json(serde_json::json!({ "id": id, "stopped": true })).into_response()
        }
        None => ErrorCode::NotFound
            .to_http_response(format!("agent session {id} not found"))
            .into_response(),
    }
}

// -- Workspace runtime assets -------------------------------------------------

/// `GET /api/workspace/env`
pub async fn workspace_env(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(control) = &s.control else {
        return ErrorCode::Upstream.to_http_response("control plane not configured").into_response();
    };
    match control.workspace_env().await {
        Ok(env) => Json(env).into_response(),
        Err(e) => ErrorCode::Upstream.to_http_response(format!("{e}")).into_response(),
    }
}

/// `GET /api/workspace/files/{name}`
pub async fn workspace_file(
    State(s): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Some(control) = &s.control else {
        return ErrorCode::Upstream.to_http_response("control plane not configured").into_response();
    };
    match control.workspace_file(&name).await {
        Ok(file) => Json(file).into_response(),
        Err(e) => ErrorCode::Upstream.to_http_response(format!("{e}")).into_response(),
    }
}

// -- Node management ----------------------------------------------------------

/// `GET /api/node/info` — full system info, node-management audience.
pub async fn node_info(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    system_info(State(s)).await
}

// -- Cookie login -------------------------------------------------------------

/// `POST /api/auth/login` — exchange a validated bearer JWT for a cookie.
pub async fn login(
    State(s): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> impl IntoResponse {
    let id = s.http_sessions.create(auth.claims.clone()).await;
    let max_age = s.http_sessions.ttl().as_secs();
    let mut cookie =
        format!("{SESSION_COOKIE}={id}; HttpOnly; SameSite=Strict; Path=/; Max-Age={max_age}");
    if s.config.https {
        cookie.push_str("; Secure");
    }
    (
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "authenticated": true, "user": auth.claims.sub })),
    )
}

/// `POST /api/auth/logout`
pub async fn logout(
    State(s): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    if let Some(id) = crate::transport::auth::cookie_value(&headers, SESSION_COOKIE) {
        s.http_sessions.remove(&id).await;
    }
    let clear = format!("{SESSION_COOKIE}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0");
    ([(header::SET_COOKIE, clear)], Json(serde_json::json!({ "authenticated": false })))
}
