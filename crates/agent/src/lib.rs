// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-VM workspace agent: multiplexes terminal and AI-agent sessions to
//! remote browsers over WebSockets, persists them across disconnects, and
//! coordinates idle shutdown with the control plane.

pub mod acp;
pub mod auth;
pub mod config;
pub mod control;
pub mod error;
pub mod idle;
pub mod manager;
pub mod pty;
pub mod ring;
pub mod state;
pub mod sysinfo;
pub mod test_support;
pub mod transport;
pub mod worktree;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::acp::HostRegistry;
use crate::auth::{JwtValidator, SessionStore};
use crate::config::AgentConfig;
use crate::control::ControlPlaneClient;
use crate::idle::{IdleConfig, IdleDetector, MetricsFn};
use crate::manager::{ContainerResolver, Manager, ManagerConfig};
use crate::state::AppState;
use crate::sysinfo::{Sysinfo, SysinfoConfig};
use crate::worktree::{WorktreeConfig, Worktrees};

/// Interval between background JWKS refreshes.
const JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
/// Interval between HTTP-session expiry sweeps.
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Construct the shared state. Nothing here touches the network.
pub fn build_state(config: AgentConfig) -> Arc<AppState> {
    let idle = IdleDetector::new(IdleConfig {
        timeout: config.idle_timeout,
        heartbeat_interval: config.heartbeat_interval,
        idle_check_interval: config.idle_check_interval,
    });
    let shutdown = idle.shutdown_token();

    let container_resolver = config.devcontainer_name.clone().map(container_resolver);

    let manager = {
        let idle = Arc::clone(&idle);
        Manager::new(
            ManagerConfig {
                default_shell: config.default_shell.clone(),
                default_rows: config.default_rows,
                default_cols: config.default_cols,
                work_dir: Some(config.workspace_dir.clone()),
                max_sessions_per_user: config.max_sessions_per_user,
                grace_period: config.orphan_grace,
                ring_capacity: config.ring_capacity,
            },
            container_resolver.clone(),
            Arc::new(move || idle.record_activity()),
        )
    };
    if let Some(user) = &config.devcontainer_user {
        manager.set_container_user(user.clone());
    }

    let sysinfo = Sysinfo::new(SysinfoConfig {
        docker_timeout: config.sysinfo_docker_timeout,
        docker_list_timeout: config.sysinfo_docker_list_timeout,
        docker_stats_timeout: config.sysinfo_docker_stats_timeout,
        disk_path: config.workspace_dir.clone(),
    });

    let worktrees = Arc::new(Worktrees::new(
        WorktreeConfig {
            repo_dir: config.workspace_dir.clone(),
            max_worktrees: config.max_worktrees,
            cache_ttl: config.worktree_cache_ttl(),
            exec_timeout: config.worktree_exec_timeout,
        },
        container_resolver.clone(),
    ));

    let control = config.control_plane_url.as_ref().map(|url| {
        Arc::new(ControlPlaneClient::new(
            url.clone(),
            config.workspace_id.clone(),
            config.callback_token.clone(),
        ))
    });

    let jwt = config
        .jwks_url
        .as_ref()
        .map(|url| JwtValidator::new(url.clone(), config.jwt_issuer.clone()));

    let http_sessions = SessionStore::new(config.http_session_ttl, config.http_session_max);
    let hosts = HostRegistry::new(config.max_agent_sessions);

    Arc::new(AppState {
        config,
        manager,
        hosts,
        idle,
        jwt,
        http_sessions,
        control,
        sysinfo,
        worktrees,
        container_resolver,
        shutdown,
        started_at: Instant::now(),
    })
}

/// Resolve the devcontainer id by name via `docker ps`.
fn container_resolver(name: String) -> ContainerResolver {
    Arc::new(move || {
        let name = name.clone();
        Box::pin(async move {
            let filter = format!("name={name}");
            let out = sysinfo::run_command(
                "docker",
                &["ps", "-q", "--filter", &filter],
                Duration::from_secs(5),
            )
            .await?;
            let id = out.lines().next().unwrap_or("").trim().to_owned();
            if id.is_empty() {
                anyhow::bail!("container {name} is not running");
            }
            Ok(id)
        })
    })
}

/// Run the agent until shutdown.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = build_state(config);
    let shutdown = state.shutdown.clone();

    // JWKS must be reachable at startup; refusing to serve without keys
    // beats accepting unverifiable tokens.
    if let Some(jwt) = &state.jwt {
        let count = jwt.refresh().await.context("initial JWKS fetch failed")?;
        info!(keys = count, "jwks loaded");
        jwt.spawn_refresh(JWKS_REFRESH_INTERVAL, shutdown.clone());
    } else {
        warn!("JWKS_URL unset; all authenticated routes will refuse access");
    }

    state.http_sessions.spawn_cleanup(SESSION_CLEANUP_INTERVAL, shutdown.clone());

    let metrics: MetricsFn = {
        let sysinfo = Arc::clone(&state.sysinfo);
        Arc::new(move || {
            sysinfo.quick_metrics().map(|m| (m.load1, m.mem_percent, m.disk_percent))
        })
    };
    state.idle.start(state.control.clone(), Some(metrics));

    spawn_sigterm_handler(Arc::clone(&state.idle));

    let router = transport::build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await.context("bind listener")?;
    info!(addr = %addr, workspace = %state.config.workspace_id, "vm-agent listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    // Coordinated teardown: loops first, then sessions and subprocesses.
    info!("shutting down: closing sessions and agent hosts");
    state.idle.stop();
    state.manager.close_all_sessions().await;
    state.hosts.stop_all().await;
    Ok(())
}

fn spawn_sigterm_handler(idle: Arc<IdleDetector>) {
    tokio::spawn(async move {
        let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
        match sigterm {
            Ok(mut stream) => {
                stream.recv().await;
                idle.trigger_shutdown("SIGTERM");
            }
            Err(e) => warn!(err = %e, "failed to install SIGTERM handler"),
        }
    });
}
