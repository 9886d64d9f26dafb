// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Provisioning-time endpoints: bootstrap token redemption and boot-log
//! relay. Both carry their own authentication (the bootstrap token itself;
//! the control plane validates relayed boot-log posts).

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::control::BootLogEntry;
use crate::error::ErrorCode;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BootstrapRequest {
    pub token: String,
}

/// `POST /api/bootstrap` — one-shot redemption that installs the callback
/// token for heartbeats.
pub async fn bootstrap(
    State(s): State<Arc<AppState>>,
    Json(req): Json<BootstrapRequest>,
) -> impl IntoResponse {
    let Some(control) = &s.control else {
        return ErrorCode::Upstream.to_http_response("control plane not configured").into_response();
    };
    if control.has_token() {
        return ErrorCode::Conflict
            .to_http_response("bootstrap token already redeemed")
            .into_response();
    }
    match control.redeem_bootstrap(&req.token).await {
        Ok(_) => {
            info!("bootstrap redeemed, callback token installed");
            Json(serde_json::json!({ "bootstrapped": true })).into_response()
        }
        Err(e) => ErrorCode::Upstream
            .to_http_response(format!("bootstrap redemption failed: {e}"))
            .into_response(),
    }
}

/// `POST /api/boot-log` — relay one structured boot-log entry upstream.
pub async fn boot_log(
    State(s): State<Arc<AppState>>,
    Json(entry): Json<BootLogEntry>,
) -> impl IntoResponse {
    let Some(control) = &s.control else {
        return ErrorCode::Upstream.to_http_response("control plane not configured").into_response();
    };
    if !matches!(entry.status.as_str(), "started" | "completed" | "failed") {
        return ErrorCode::BadRequest
            .to_http_response("status must be started, completed, or failed")
            .into_response();
    }
    match control.boot_log(&entry).await {
        Ok(()) => Json(serde_json::json!({ "relayed": true })).into_response(),
        Err(e) => ErrorCode::Upstream
            .to_http_response(format!("boot-log relay failed: {e}"))
            .into_response(),
    }
}
