// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Registry and lifecycle controller for PTY sessions.
//!
//! The manager is the exclusive owner of all sessions on this VM. Sessions
//! hold no back-reference to it; lifecycle notifications flow through the
//! callback closures installed at creation time.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AgentError, ErrorCode};
use crate::pty::{ContainerExec, Session, SessionConfig, SessionInfo};
use crate::ring;

/// Resolves the current devcontainer id, or errors when it is not ready.
/// Returns an empty string when container mode is off.
pub type ContainerResolver =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>> + Send + Sync>;

/// Invoked whenever any session produces or consumes bytes.
pub type ActivityCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub default_shell: String,
    pub default_rows: u16,
    pub default_cols: u16,
    /// Default working directory for new sessions.
    pub work_dir: Option<PathBuf>,
    /// Per-user cap on non-orphaned sessions. 0 disables the limit.
    pub max_sessions_per_user: usize,
    /// How long an orphaned session survives before auto-close. Zero
    /// disables auto-cleanup.
    pub grace_period: Duration,
    pub ring_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_shell: "/bin/bash".to_owned(),
            default_rows: 24,
            default_cols: 80,
            work_dir: None,
            max_sessions_per_user: 0,
            grace_period: Duration::ZERO,
            ring_capacity: ring::DEFAULT_CAPACITY,
        }
    }
}

/// Parameters for creating one session.
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    /// Client-chosen id; generated when absent.
    pub id: Option<String>,
    pub user_id: String,
    pub rows: u16,
    pub cols: u16,
    /// Overrides the manager's default working directory.
    pub work_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

pub struct Manager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: ManagerConfig,
    container_resolver: Option<ContainerResolver>,
    /// May be set after construction; only sessions created afterwards
    /// pick it up.
    container_user: parking_lot::RwLock<Option<String>>,
    on_activity: ActivityCallback,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        container_resolver: Option<ContainerResolver>,
        on_activity: ActivityCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            container_resolver,
            container_user: parking_lot::RwLock::new(None),
            on_activity,
        })
    }

    pub fn set_container_user(&self, user: impl Into<String>) {
        *self.container_user.write() = Some(user.into());
    }

    /// Create and register a session.
    pub async fn create_session(
        self: &Arc<Self>,
        req: CreateSession,
    ) -> Result<Arc<Session>, AgentError> {
        let id = match req.id {
            Some(id) => id,
            None => generate_session_id(),
        };

        // Resolve the container before taking the write lock; the checks
        // are repeated under the lock below.
        let container = match &self.container_resolver {
            Some(resolve) => match resolve().await {
                Ok(cid) if cid.is_empty() => None,
                Ok(cid) => Some(ContainerExec {
                    container_id: cid,
                    user: self.container_user.read().clone(),
                }),
                Err(e) => {
                    return Err(AgentError::new(
                        ErrorCode::ContainerNotReady,
                        format!("devcontainer not ready: {e}"),
                    ));
                }
            },
            None => None,
        };

        let rows = if req.rows > 0 { req.rows } else { self.config.default_rows };
        let cols = if req.cols > 0 { req.cols } else { self.config.default_cols };
        let work_dir = req.work_dir.or_else(|| self.config.work_dir.clone());

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(AgentError::new(
                ErrorCode::Conflict,
                format!("session {id} already exists"),
            ));
        }

        let cap = self.config.max_sessions_per_user;
        if cap > 0 {
            let used = sessions
                .values()
                .filter(|s| s.user_id() == req.user_id && !s.is_orphaned())
                .count();
            if used >= cap {
                return Err(AgentError::new(
                    ErrorCode::QuotaExceeded,
                    format!("session limit reached for user {}", req.user_id),
                )
                .details(serde_json::json!({ "limit": cap, "current": used })));
            }
        }

        let session = Session::spawn(SessionConfig {
            id: id.clone(),
            user_id: req.user_id,
            shell: self.config.default_shell.clone(),
            rows,
            cols,
            work_dir,
            env: req.env,
            container,
            ring_capacity: self.config.ring_capacity,
        })
        .map_err(|e| AgentError::new(ErrorCode::Internal, format!("pty spawn failed: {e}")))?;

        sessions.insert(id.clone(), Arc::clone(&session));
        drop(sessions);

        let on_activity = Arc::clone(&self.on_activity);
        let manager = Arc::clone(self);
        session.start_output_reader(
            Arc::new(move |_id, _chunk| on_activity()),
            Arc::new(move |id: &str| {
                let manager = Arc::clone(&manager);
                let id = id.to_owned();
                tokio::spawn(async move {
                    manager.remove_exited(&id).await;
                });
            }),
        );

        info!(session = %id, "created pty session");
        Ok(session)
    }

    /// Drop a session whose process has exited.
    async fn remove_exited(&self, id: &str) {
        if let Some(session) = self.sessions.write().await.remove(id) {
            debug!(session = %id, code = ?session.exit_code(), "reaping exited session");
            session.close();
        }
    }

    /// Mark a session orphaned: clear its writer and start the grace timer.
    pub async fn orphan_session(self: &Arc<Self>, id: &str) -> Result<(), AgentError> {
        let session = self.get_session(id).await.ok_or_else(|| AgentError::not_found(id))?;

        let cancel = CancellationToken::new();
        session.mark_orphaned(cancel.clone());

        if self.config.grace_period > Duration::ZERO {
            let manager = Arc::clone(self);
            let grace = self.config.grace_period;
            let id = id.to_owned();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(grace) => {
                        manager.expire_orphan(&id, &cancel).await;
                    }
                }
            });
        }
        Ok(())
    }

    pub async fn orphan_sessions(self: &Arc<Self>, ids: &[String]) {
        for id in ids {
            if let Err(e) = self.orphan_session(id).await {
                debug!(session = %id, err = %e, "orphan skipped");
            }
        }
    }

    /// Close an orphan whose grace expired, unless a reattach won the race.
    async fn expire_orphan(&self, id: &str, cancel: &CancellationToken) {
        let mut sessions = self.sessions.write().await;
        // Reattach cancels the token while holding this same lock, so the
        // check and the removal are a single atomic step.
        if cancel.is_cancelled() {
            return;
        }
        if let Some(session) = sessions.remove(id) {
            info!(session = %id, "orphan grace expired, closing session");
            session.close();
        }
    }

    /// Cancel a pending orphan timer and hand the session back.
    pub async fn reattach_session(&self, id: &str) -> Result<Arc<Session>, AgentError> {
        let sessions = self.sessions.write().await;
        let session = sessions.get(id).cloned().ok_or_else(|| AgentError::not_found(id))?;
        session.clear_orphaned();
        Ok(session)
    }

    // -- Queries --------------------------------------------------------------

    pub async fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id() == user_id)
            .cloned()
            .collect()
    }

    /// Copy of the whole registry.
    pub async fn all_sessions(&self) -> HashMap<String, Arc<Session>> {
        self.sessions.read().await.clone()
    }

    /// `SessionInfo` snapshots, optionally filtered by user.
    pub async fn active_infos(&self, user_id: Option<&str>) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| user_id.is_none_or(|u| s.user_id() == u))
            .map(|s| s.info())
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Non-orphaned sessions for one user; this is the quota counter.
    pub async fn session_count_for_user(&self, user_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id() == user_id && !s.is_orphaned())
            .count()
    }

    pub async fn orphaned_count(&self) -> usize {
        self.sessions.read().await.values().filter(|s| s.is_orphaned()).count()
    }

    /// Most recent activity instant across all sessions.
    pub async fn last_activity(&self) -> Option<Instant> {
        self.sessions.read().await.values().map(|s| s.last_activity()).max()
    }

    pub async fn set_session_name(&self, id: &str, name: &str) -> Result<(), AgentError> {
        let session = self.get_session(id).await.ok_or_else(|| AgentError::not_found(id))?;
        session.set_name(name);
        Ok(())
    }

    // -- Closing --------------------------------------------------------------

    pub async fn close_session(&self, id: &str) -> Result<(), AgentError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| AgentError::not_found(id))?;
        session.close();
        Ok(())
    }

    pub async fn close_user_sessions(&self, user_id: &str) -> usize {
        let mut sessions = self.sessions.write().await;
        let ids: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.user_id() == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(s) = sessions.remove(id) {
                s.close();
            }
        }
        ids.len()
    }

    pub async fn close_all_sessions(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, s) in sessions.drain() {
            s.close();
        }
    }

    /// Close every session idle for longer than `max_idle`; returns the
    /// number closed.
    pub async fn cleanup_idle_sessions(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.idle_time() > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(s) = sessions.remove(id) {
                warn!(session = %id, "closing idle session");
                s.close();
            }
        }
        stale.len()
    }
}

/// 16 random bytes rendered as lowercase hex.
pub fn generate_session_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(32), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
