// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worktree CRUD over the devcontainer's git.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::state::AppState;

/// `GET /api/worktrees`
pub async fn list_worktrees(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    match s.worktrees.list().await {
        Ok(list) => Json(list).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateWorktreeRequest {
    pub branch: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// `POST /api/worktrees`
pub async fn create_worktree(
    State(s): State<Arc<AppState>>,
    Json(req): Json<CreateWorktreeRequest>,
) -> impl IntoResponse {
    match s.worktrees.create(&req.branch, req.path).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct RemoveWorktreeQuery {
    pub path: String,
}

/// `DELETE /api/worktrees`
pub async fn remove_worktree(
    State(s): State<Arc<AppState>>,
    Query(query): Query<RemoveWorktreeQuery>,
) -> impl IntoResponse {
    match s.worktrees.remove(&query.path).await {
        Ok(()) => Json(serde_json::json!({ "removed": true, "path": query.path })).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}
