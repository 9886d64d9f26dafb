// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Git worktrees inside the devcontainer.
//!
//! `git worktree list --porcelain` is the single source of truth: its
//! output is cached with a short TTL, and any path accepted through a
//! `worktree=` parameter must appear in that list before it is used.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{AgentError, ErrorCode};
use crate::manager::ContainerResolver;
use crate::sysinfo::run_command;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
    pub head: String,
    pub is_primary: bool,
    pub dirty: bool,
    pub dirty_count: usize,
}

#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    pub repo_dir: PathBuf,
    pub max_worktrees: usize,
    pub cache_ttl: Duration,
    pub exec_timeout: Duration,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            repo_dir: PathBuf::from("/workspace"),
            max_worktrees: 10,
            cache_ttl: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Worktrees {
    config: WorktreeConfig,
    container_resolver: Option<ContainerResolver>,
    cache: RwLock<Option<(Instant, Vec<WorktreeInfo>)>>,
}

impl Worktrees {
    pub fn new(config: WorktreeConfig, container_resolver: Option<ContainerResolver>) -> Self {
        Self { config, container_resolver, cache: RwLock::new(None) }
    }

    /// Run git inside the devcontainer (or directly when container mode
    /// is off), rooted at the given directory.
    async fn run_git(&self, dir: &str, args: &[&str]) -> Result<String, AgentError> {
        let output = match &self.container_resolver {
            Some(resolve) => {
                let cid = resolve().await.map_err(|e| {
                    AgentError::new(
                        ErrorCode::ContainerNotReady,
                        format!("devcontainer not ready: {e}"),
                    )
                })?;
                if cid.is_empty() {
                    self.run_git_direct(dir, args).await
                } else {
                    let mut argv = vec!["exec", "-w", dir, cid.as_str(), "git"];
                    argv.extend(args);
                    run_command("docker", &argv, self.config.exec_timeout).await
                }
            }
            None => self.run_git_direct(dir, args).await,
        };
        output.map_err(|e| AgentError::new(ErrorCode::Upstream, format!("git failed: {e}")))
    }

    async fn run_git_direct(&self, dir: &str, args: &[&str]) -> anyhow::Result<String> {
        let mut argv = vec!["-C", dir];
        argv.extend(args);
        run_command("git", &argv, self.config.exec_timeout).await
    }

    /// Current worktrees, from cache when fresh.
    pub async fn list(&self) -> Result<Vec<WorktreeInfo>, AgentError> {
        if let Some((at, cached)) = self.cache.read().await.as_ref() {
            if at.elapsed() < self.config.cache_ttl {
                return Ok(cached.clone());
            }
        }
        self.refresh().await
    }

    /// Re-read the canonical list from git and recompute dirtiness.
    pub async fn refresh(&self) -> Result<Vec<WorktreeInfo>, AgentError> {
        let repo = self.config.repo_dir.display().to_string();
        let porcelain = self.run_git(&repo, &["worktree", "list", "--porcelain"]).await?;
        let mut infos = parse_porcelain(&porcelain);

        for info in &mut infos {
            match self.run_git(&info.path, &["status", "--porcelain"]).await {
                Ok(status) => {
                    info.dirty_count = status.lines().filter(|l| !l.trim().is_empty()).count();
                    info.dirty = info.dirty_count > 0;
                }
                Err(e) => debug!(worktree = %info.path, err = %e, "status check failed"),
            }
        }

        *self.cache.write().await = Some((Instant::now(), infos.clone()));
        Ok(infos)
    }

    /// Accept a `worktree=` parameter only if it names a known worktree.
    pub async fn validate(&self, path: &str) -> Result<PathBuf, AgentError> {
        let list = self.list().await?;
        if list.iter().any(|w| w.path == path) {
            return Ok(PathBuf::from(path));
        }
        // The cache may predate a freshly added worktree.
        let list = self.refresh().await?;
        if list.iter().any(|w| w.path == path) {
            Ok(PathBuf::from(path))
        } else {
            Err(AgentError::new(ErrorCode::NotFound, format!("unknown worktree {path}")))
        }
    }

    /// `git worktree add`, creating the branch when it does not exist yet.
    pub async fn create(
        &self,
        branch: &str,
        path: Option<String>,
    ) -> Result<WorktreeInfo, AgentError> {
        let existing = self.refresh().await?;
        if existing.len() >= self.config.max_worktrees {
            return Err(AgentError::new(
                ErrorCode::QuotaExceeded,
                "worktree limit reached for this workspace",
            )
            .details(serde_json::json!({
                "limit": self.config.max_worktrees,
                "current": existing.len(),
            })));
        }
        if existing.iter().any(|w| w.branch.as_deref() == Some(branch)) {
            return Err(AgentError::new(
                ErrorCode::Conflict,
                format!("branch {branch} is already checked out in another worktree"),
            ));
        }

        let path = path.unwrap_or_else(|| default_worktree_path(&self.config.repo_dir, branch));
        let repo = self.config.repo_dir.display().to_string();

        // Prefer an existing branch; fall back to creating it.
        let added = self.run_git(&repo, &["worktree", "add", &path, branch]).await;
        if added.is_err() {
            self.run_git(&repo, &["worktree", "add", "-b", branch, &path]).await?;
        }

        let infos = self.refresh().await?;
        infos
            .into_iter()
            .find(|w| w.path == path)
            .ok_or_else(|| AgentError::new(ErrorCode::Internal, "created worktree not listed"))
    }

    /// `git worktree remove` after validating the path.
    pub async fn remove(&self, path: &str) -> Result<(), AgentError> {
        let target = self.validate(path).await?;
        let list = self.list().await?;
        if list.iter().any(|w| w.path == path && w.is_primary) {
            return Err(AgentError::new(
                ErrorCode::Conflict,
                "the primary worktree cannot be removed",
            ));
        }
        let repo = self.config.repo_dir.display().to_string();
        let target = target.display().to_string();
        self.run_git(&repo, &["worktree", "remove", &target]).await?;
        self.invalidate().await;
        Ok(())
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}

/// Parse `git worktree list --porcelain` output. The first block is the
/// primary worktree.
pub fn parse_porcelain(output: &str) -> Vec<WorktreeInfo> {
    let mut infos = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            if let Some(info) = current.take() {
                infos.push(info);
            }
            continue;
        }
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(info) = current.take() {
                infos.push(info);
            }
            current = Some(WorktreeInfo {
                path: path.to_owned(),
                branch: None,
                head: String::new(),
                is_primary: infos.is_empty(),
                dirty: false,
                dirty_count: 0,
            });
        } else if let Some(info) = current.as_mut() {
            if let Some(head) = line.strip_prefix("HEAD ") {
                info.head = head.to_owned();
            } else if let Some(branch) = line.strip_prefix("branch ") {
                info.branch = Some(branch.strip_prefix("refs/heads/").unwrap_or(branch).to_owned());
            }
            // `detached` and `bare` markers leave branch as None.
        }
    }
    if let Some(info) = current.take() {
        infos.push(info);
    }
    infos
}

fn default_worktree_path(repo_dir: &std::path::Path, branch: &str) -> String {
    let safe: String = branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    repo_dir.join(".worktrees").join(safe).display().to_string()
}

#[cfg(test)]
#[path = "worktree_tests.rs"]
mod tests;
