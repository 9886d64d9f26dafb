// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent WebSocket: one socket per viewer of one ACP session.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::acp::{AcpHost, AgentKind, Credential, CredentialKind, HostConfig, PermissionMode};
use crate::auth::jwt::Audience;
use crate::error::{AgentError, ErrorCode};
use crate::idle::IdleDetector;
use crate::state::AppState;
use crate::transport::auth::{authenticate, bearer_token, validate_token};

#[derive(Debug, Clone, Deserialize)]
pub struct AgentQuery {
    pub token: Option<String>,
    pub workspace: Option<String>,
    /// Resume an existing agent session by id; omitted to start fresh.
    pub session_id: Option<String>,
    /// Agent type for new sessions. Default `claude-code`.
    pub agent: Option<String>,
    /// Permission mode for new sessions. Default `default`.
    pub permission_mode: Option<String>,
    /// Worktree path to run the agent in.
    pub worktree: Option<String>,
}

/// Messages a viewer may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ViewerMessage {
    Prompt { content: Value },
    Approval { id: Value, approved: bool },
    Cancel {},
    Stop {},
}

/// `GET /ws/agent` upgrade handler.
pub async fn ws_agent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let audience = Audience::Workspace {
        workspace_id: state.expected_workspace(query.workspace.as_deref()),
    };
    let claims = match &query.token {
        Some(token) => validate_token(&state, token, audience).await,
        None => match bearer_token(&headers) {
            Some(token) => validate_token(&state, &token, audience).await,
            None => authenticate(&state, &headers, audience).await,
        },
    };
    if let Err(e) = claims {
        return e.to_http_response().into_response();
    }

    // Locate or spawn the host before upgrading so that credential and
    // quota problems surface as actionable HTTP errors.
    let host = match locate_or_spawn(&state, &query).await {
        Ok(host) => host,
        Err(e) => return e.to_http_response().into_response(),
    };

    let idle = Arc::clone(&state.idle);
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| handle_viewer(host, idle, shutdown, socket)).into_response()
}

async fn locate_or_spawn(
    state: &Arc<AppState>,
    query: &AgentQuery,
) -> Result<Arc<AcpHost>, AgentError> {
    if let Some(session_id) = &query.session_id {
        if let Some(host) = state.hosts.get(session_id).await {
            return Ok(host);
        }
    }

    let agent = match &query.agent {
        Some(name) => AgentKind::parse(name).ok_or_else(|| {
            AgentError::new(ErrorCode::BadRequest, format!("unknown agent type {name}"))
        })?,
        None => AgentKind::ClaudeCode,
    };
    let permission_mode = match &query.permission_mode {
        Some(mode) => PermissionMode::parse(mode).ok_or_else(|| {
            AgentError::new(ErrorCode::BadRequest, format!("unknown permission mode {mode}"))
        })?,
        None => PermissionMode::Default,
    };
    let cwd = match &query.worktree {
        Some(path) => state.worktrees.validate(path).await?,
        None => state.config.workspace_dir.clone(),
    };
    let credential = resolve_credential(agent).ok_or_else(|| {
        AgentError::new(
            ErrorCode::ContainerNotReady,
            format!(
                "no credential configured for {agent}; set {} and reconnect",
                agent.credential_env(CredentialKind::ApiKey)
            ),
        )
    })?;

    let idle = Arc::clone(&state.idle);
    let host = AcpHost::start(HostConfig {
        agent,
        cwd,
        permission_mode,
        credential: Some(credential),
        resume_session: query.session_id.clone(),
        idle_grace: state.config.agent_idle_grace,
        on_activity: Some(Arc::new(move || idle.record_activity())),
    })
    .await?;

    match state.hosts.insert(Arc::clone(&host)).await {
        Ok(session_id) => {
            info!(session = %session_id, agent = %agent, "agent host started");
            Ok(host)
        }
        Err(e) => {
            host.stop();
            Err(e)
        }
    }
}

/// Credentials are injected into the VM environment by the control plane;
/// pick the variable matching the agent and credential kind.
fn resolve_credential(agent: AgentKind) -> Option<Credential> {
    let oauth = agent.credential_env(CredentialKind::OauthToken);
    if let Ok(value) = std::env::var(oauth) {
        if !value.is_empty() {
            return Some(Credential { kind: CredentialKind::OauthToken, value });
        }
    }
    let api_key = agent.credential_env(CredentialKind::ApiKey);
    match std::env::var(api_key) {
        Ok(value) if !value.is_empty() => {
            Some(Credential { kind: CredentialKind::ApiKey, value })
        }
        _ => None,
    }
}

async fn handle_viewer(
    host: Arc<AcpHost>,
    idle: Arc<IdleDetector>,
    shutdown: tokio_util::sync::CancellationToken,
    socket: WebSocket,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (viewer_id, mut event_rx, snapshot) = host.add_viewer();

    // Replay the transcript, then stream live events.
    for event in snapshot {
        if send_json(&mut ws_tx, &event).await.is_err() {
            host.remove_viewer(viewer_id);
            return;
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                if send_json(&mut ws_tx, &event).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        idle.record_activity();
                        let viewer_msg: ViewerMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => continue,
                        };
                        handle_viewer_message(&host, viewer_msg).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    host.remove_viewer(viewer_id);
    debug!(viewer = viewer_id, "agent viewer disconnected");
}

async fn handle_viewer_message(host: &Arc<AcpHost>, msg: ViewerMessage) {
    match msg {
        ViewerMessage::Prompt { content } => {
            // The host serializes turns; run each prompt out of band so
            // event streaming never stalls behind a long turn.
            let host = Arc::clone(host);
            tokio::spawn(async move {
                if let Err(e) = host.prompt(content).await {
                    debug!(err = %e, "prompt failed");
                }
                host.maybe_idle_stop();
            });
        }
        ViewerMessage::Approval { id, approved } => host.respond_permission(id, approved),
        ViewerMessage::Cancel {} => {
            let _ = host.cancel_turn().await;
        }
        ViewerMessage::Stop {} => host.stop(),
    }
}

async fn send_json<S, T>(tx: &mut S, value: &T) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
    T: serde::Serialize,
{
    let text = serde_json::to_string(value).map_err(|_| ())?;
    tx.send(Message::Text(text.into())).await.map_err(|_| ())
}
