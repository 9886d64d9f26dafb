// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the on-VM agent.

pub mod auth;
pub mod bootstrap;
pub mod http;
pub mod http_files;
pub mod http_worktree;
pub mod ws_agent;
pub mod ws_term;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Build the axum `Router` with all agent routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // System (health is unauthenticated)
        .route("/health", get(http::health))
        .route("/api/system-info", get(http::system_info))
        .route("/api/quick-metrics", get(http::quick_metrics))
        .route("/api/activity", post(http::record_activity))
        // Cookie login
        .route("/api/auth/login", post(http::login))
        .route("/api/auth/logout", post(http::logout))
        // Terminal sessions
        .route("/api/sessions", get(http::list_sessions))
        .route("/api/sessions/{id}", delete(http::close_session))
        .route("/api/sessions/{id}/name", put(http::rename_session))
        // Agent sessions
        .route("/api/agent-sessions", get(http::list_agent_sessions))
        .route("/api/agent-sessions/{id}", delete(http::stop_agent_session))
        // Workspace runtime assets
        .route("/api/workspace/env", get(http::workspace_env))
        .route("/api/workspace/files/{name}", get(http::workspace_file))
        // Worktrees
        .route(
            "/api/worktrees",
            get(http_worktree::list_worktrees)
                .post(http_worktree::create_worktree)
                .delete(http_worktree::remove_worktree),
        )
        // Files and git
        .route("/api/files", get(http_files::list_dir))
        .route("/api/files/find", get(http_files::find_files))
        .route("/api/files/content", get(http_files::read_file))
        .route("/api/git/status", get(http_files::git_status))
        .route("/api/git/diff", get(http_files::git_diff))
        .route("/api/git/show", get(http_files::git_file_at_head))
        // Node management
        .route("/api/node/info", get(http::node_info))
        // Provisioning
        .route("/api/bootstrap", post(bootstrap::bootstrap))
        .route("/api/boot-log", post(bootstrap::boot_log))
        // WebSockets
        .route("/ws/terminal", get(ws_term::ws_terminal))
        .route("/ws/agent", get(ws_agent::ws_agent))
        // Middleware
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
