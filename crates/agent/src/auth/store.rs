// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory HTTP session store with LRU eviction and periodic expiry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::jwt::Claims;

/// Name of the authentication cookie.
pub const SESSION_COOKIE: &str = "vm_agent_session";

struct Entry {
    claims: Claims,
    expires_at: Instant,
}

/// Cookie-backed sessions bound to validated JWT claims.
///
/// Uses `IndexMap` for O(1) insert/remove with insertion-order iteration:
/// most-recently-used entries sit at the back, eviction pops the front.
pub struct SessionStore {
    entries: RwLock<IndexMap<String, Entry>>,
    ttl: Duration,
    max_entries: usize,
}

impl SessionStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(IndexMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a session for validated claims; returns the opaque cookie id.
    pub async fn create(&self, claims: Claims) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut entries = self.entries.write().await;
        entries.insert(
            id.clone(),
            Entry { claims, expires_at: Instant::now() + self.ttl },
        );
        while entries.len() > self.max_entries {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                debug!(session = %evicted, "evicting http session (lru)");
            }
        }
        id
    }

    /// Look up a session, refreshing its LRU position.
    pub async fn get(&self, id: &str) -> Option<Claims> {
        let mut entries = self.entries.write().await;
        let entry = entries.shift_remove(id)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        let claims = entry.claims.clone();
        entries.insert(id.to_owned(), entry);
        Some(claims)
    }

    pub async fn remove(&self, id: &str) {
        self.entries.write().await.shift_remove(id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drop expired entries. Returns how many were purged.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    /// Periodic cleanup loop.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let purged = store.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "purged expired http sessions");
                }
            }
        });
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
