// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared application state, constructed once in `run()` and passed to all
//! handlers via the axum `State` extractor. None of these are implicit
//! globals; everything is torn down on shutdown.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::acp::HostRegistry;
use crate::auth::{JwtValidator, SessionStore};
use crate::config::AgentConfig;
use crate::control::ControlPlaneClient;
use crate::idle::IdleDetector;
use crate::manager::{ContainerResolver, Manager};
use crate::sysinfo::Sysinfo;
use crate::worktree::Worktrees;

pub struct AppState {
    pub config: AgentConfig,
    pub manager: Arc<Manager>,
    pub hosts: Arc<HostRegistry>,
    pub idle: Arc<IdleDetector>,
    /// Absent when `JWKS_URL` is unset; all authenticated routes then
    /// refuse access.
    pub jwt: Option<Arc<JwtValidator>>,
    pub http_sessions: Arc<SessionStore>,
    pub control: Option<Arc<ControlPlaneClient>>,
    pub sysinfo: Arc<Sysinfo>,
    pub worktrees: Arc<Worktrees>,
    /// Resolves the devcontainer id for file and git operations.
    pub container_resolver: Option<ContainerResolver>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    /// The workspace id a token's `workspace` claim must match.
    ///
    /// Single-workspace deployments pin it via config; multi-workspace
    /// nodes take it from the URL instead. A malformed URL-provided id
    /// yields an empty expectation, which no valid claim can satisfy.
    pub fn expected_workspace<'a>(&'a self, from_url: Option<&'a str>) -> &'a str {
        if self.config.workspace_id.is_empty() {
            from_url.filter(|id| crate::auth::jwt::is_workspace_id(id)).unwrap_or("")
        } else {
            self.config.workspace_id.as_str()
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("workspace_id", &self.config.workspace_id)
            .field("node_id", &self.config.node_id)
            .finish()
    }
}
