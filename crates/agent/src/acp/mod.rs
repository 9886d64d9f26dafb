// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent Client Protocol: subprocess bridge, wire dialect, and the
//! process-wide host registry.

pub mod host;
pub mod proto;
pub mod registry;

pub use host::{AcpHost, HostConfig, HostEvent, HostInfo, HostStatus};
pub use proto::PermissionMode;
pub use registry::{AgentKind, Credential, CredentialKind};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{AgentError, ErrorCode};

/// Process-wide registry of live agent hosts, keyed by session id.
pub struct HostRegistry {
    hosts: RwLock<HashMap<String, Arc<AcpHost>>>,
    /// Cap on concurrent agent sessions per workspace. 0 disables.
    max_sessions: usize,
}

impl HostRegistry {
    pub fn new(max_sessions: usize) -> Arc<Self> {
        Arc::new(Self { hosts: RwLock::new(HashMap::new()), max_sessions })
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<AcpHost>> {
        let hosts = self.hosts.read().await;
        hosts.get(session_id).cloned().filter(|h| !h.is_stopped())
    }

    /// Register a freshly started host under its agent-assigned session id.
    pub async fn insert(&self, host: Arc<AcpHost>) -> Result<String, AgentError> {
        let session_id = host.session_id().ok_or_else(|| {
            AgentError::new(ErrorCode::Internal, "host has no session id")
        })?;
        let mut hosts = self.hosts.write().await;
        hosts.retain(|_, h| !h.is_stopped());
        if self.max_sessions > 0 && hosts.len() >= self.max_sessions {
            return Err(AgentError::new(
                ErrorCode::QuotaExceeded,
                "agent session limit reached for this workspace",
            )
            .details(serde_json::json!({
                "limit": self.max_sessions,
                "current": hosts.len(),
            })));
        }
        hosts.insert(session_id.clone(), host);
        Ok(session_id)
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<AcpHost>> {
        self.hosts.write().await.remove(session_id)
    }

    pub async fn list(&self) -> Vec<HostInfo> {
        self.hosts.read().await.values().map(|h| h.info()).collect()
    }

    pub async fn count(&self) -> usize {
        self.hosts.read().await.len()
    }

    /// Stop every host (process shutdown).
    pub async fn stop_all(&self) {
        let mut hosts = self.hosts.write().await;
        for (_, host) in hosts.drain() {
            host.stop();
        }
    }
}
