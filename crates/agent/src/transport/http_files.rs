// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File browsing and git queries, executed inside the devcontainer.
//!
//! Every endpoint accepts an optional `worktree=` parameter that replaces
//! the default working directory; the path must name a worktree from the
//! canonical list or the request is rejected.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, ErrorCode};
use crate::state::AppState;
use crate::sysinfo::run_command;

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub worktree: Option<String>,
    /// For `find`: the file name pattern.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Resolve the effective working directory for one request.
async fn base_dir(state: &AppState, worktree: Option<&str>) -> Result<PathBuf, AgentError> {
    match worktree {
        Some(path) => state.worktrees.validate(path).await,
        None => Ok(state.config.workspace_dir.clone()),
    }
}

/// Reject traversal and absolute paths in user-supplied relative paths.
fn clean_relative(path: &str) -> Result<&str, AgentError> {
    let trimmed = path.trim_start_matches("./");
    if trimmed.starts_with('/') || trimmed.split('/').any(|c| c == "..") {
        return Err(AgentError::new(
            ErrorCode::BadRequest,
            "path must be relative and free of traversal",
        ));
    }
    Ok(trimmed)
}

/// Run a command in the request's working directory, inside the container
/// when one is configured.
async fn run_in(
    state: &AppState,
    dir: &std::path::Path,
    program: &str,
    args: &[&str],
) -> Result<String, AgentError> {
    let timeout = state.config.worktree_exec_timeout;
    let dir_s = dir.display().to_string();

    let result = match &state.container_resolver {
        Some(resolve) => {
            let cid = resolve().await.map_err(|e| {
                AgentError::new(ErrorCode::ContainerNotReady, format!("devcontainer not ready: {e}"))
            })?;
            if cid.is_empty() {
                run_dir(program, args, &dir_s, timeout).await
            } else {
                let mut argv = vec!["exec", "-w", dir_s.as_str(), cid.as_str(), program];
                argv.extend(args);
                run_command("docker", &argv, timeout).await
            }
        }
        None => run_dir(program, args, &dir_s, timeout).await,
    };
    result.map_err(|e| AgentError::new(ErrorCode::Upstream, format!("{program} failed: {e}")))
}

async fn run_dir(
    program: &str,
    args: &[&str],
    dir: &str,
    timeout: std::time::Duration,
) -> anyhow::Result<String> {
    let fut = tokio::process::Command::new(program)
        .args(args)
        .current_dir(dir)
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| anyhow::anyhow!("{program} timed out"))??;
    if !output.status.success() {
        anyhow::bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `GET /api/files` — list a directory.
pub async fn list_dir(
    State(s): State<Arc<AppState>>,
    Query(q): Query<FileQuery>,
) -> impl IntoResponse {
    let result = async {
        let base = base_dir(&s, q.worktree.as_deref()).await?;
        let rel = clean_relative(q.path.as_deref().unwrap_or("."))?;
        let out = run_in(&s, &base, "ls", &["-1Ap", "--", rel]).await?;
        let entries: Vec<DirEntry> = out
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| DirEntry {
                name: l.trim_end_matches('/').to_owned(),
                is_dir: l.ends_with('/'),
            })
            .collect();
        Ok::<_, AgentError>(entries)
    }
    .await;
    match result {
        Ok(entries) => Json(serde_json::json!({ "entries": entries })).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

/// `GET /api/files/find` — find files by name.
pub async fn find_files(
    State(s): State<Arc<AppState>>,
    Query(q): Query<FileQuery>,
) -> impl IntoResponse {
    let result = async {
        let base = base_dir(&s, q.worktree.as_deref()).await?;
        let name = q
            .name
            .as_deref()
            .ok_or_else(|| AgentError::new(ErrorCode::BadRequest, "name parameter required"))?;
        let out = run_in(
            &s,
            &base,
            "find",
            &[".", "-maxdepth", "8", "-name", name, "-not", "-path", "*/.git/*"],
        )
        .await?;
        let matches: Vec<&str> =
            out.lines().map(|l| l.trim_start_matches("./")).filter(|l| !l.is_empty()).collect();
        Ok::<_, AgentError>(serde_json::json!({ "matches": matches }))
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

/// `GET /api/files/content` — read one file.
pub async fn read_file(
    State(s): State<Arc<AppState>>,
    Query(q): Query<FileQuery>,
) -> impl IntoResponse {
    let result = async {
        let base = base_dir(&s, q.worktree.as_deref()).await?;
        let rel = q
            .path
            .as_deref()
            .ok_or_else(|| AgentError::new(ErrorCode::BadRequest, "path parameter required"))?;
        let rel = clean_relative(rel)?;
        let content = run_in(&s, &base, "cat", &["--", rel]).await?;
        Ok::<_, AgentError>(serde_json::json!({ "path": rel, "content": content }))
    }
    .await;
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

// -- Git ----------------------------------------------------------------------

/// `GET /api/git/status`
pub async fn git_status(
    State(s): State<Arc<AppState>>,
    Query(q): Query<FileQuery>,
) -> impl IntoResponse {
    git_passthrough(&s, q.worktree.as_deref(), &["status", "--porcelain=v1", "-b"], "status").await
}

/// `GET /api/git/diff`
pub async fn git_diff(
    State(s): State<Arc<AppState>>,
    Query(q): Query<FileQuery>,
) -> impl IntoResponse {
    match q.path.as_deref() {
        Some(path) => {
            let result = async {
                let rel = clean_relative(path)?;
                let base = base_dir(&s, q.worktree.as_deref()).await?;
                run_in(&s, &base, "git", &["diff", "--", rel]).await
            }
            .await;
            respond_raw(result, "diff")
        }
        None => git_passthrough(&s, q.worktree.as_deref(), &["diff"], "diff").await,
    }
}

/// `GET /api/git/show` — a file's contents at HEAD.
pub async fn git_file_at_head(
    State(s): State<Arc<AppState>>,
    Query(q): Query<FileQuery>,
) -> impl IntoResponse {
    let result = async {
        let rel = q
            .path
            .as_deref()
            .ok_or_else(|| AgentError::new(ErrorCode::BadRequest, "path parameter required"))?;
        let rel = clean_relative(rel)?;
        let base = base_dir(&s, q.worktree.as_deref()).await?;
        run_in(&s, &base, "git", &["show", &format!("HEAD:{rel}")]).await
    }
    .await;
    respond_raw(result, "content")
}

async fn git_passthrough(
    state: &Arc<AppState>,
    worktree: Option<&str>,
    args: &[&str],
    key: &str,
) -> axum::response::Response {
    let result = async {
        let base = base_dir(state, worktree).await?;
        run_in(state, &base, "git", args).await
    }
    .await;
    respond_raw(result, key)
}

fn respond_raw(result: Result<String, AgentError>, key: &str) -> axum::response::Response {
    match result {
        Ok(out) => Json(serde_json::json!({ key: out })).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}
