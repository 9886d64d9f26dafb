// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Multiplexed terminal WebSocket: any number of PTY sessions over one
//! socket, with scrollback replay on reattach.

#[path = "ws_term_msg.rs"]
mod msg;
pub use msg::*;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::auth::jwt::Audience;
use crate::manager::CreateSession;
use crate::pty::{Session, SessionEvent};
use crate::state::AppState;
use crate::transport::auth::{authenticate, bearer_token, validate_token};

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 256;
/// Per-session event queue between the PTY reader and this connection.
const SESSION_QUEUE: usize = 256;

/// `GET /ws/terminal` upgrade handler.
pub async fn ws_terminal(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TermQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let audience = Audience::Workspace {
        workspace_id: state.expected_workspace(query.workspace.as_deref()),
    };
    // Token from query param, bearer header, or session cookie.
    let claims = match &query.token {
        Some(token) => validate_token(&state, token, audience).await,
        None => match bearer_token(&headers) {
            Some(token) => validate_token(&state, &token, audience).await,
            None => authenticate(&state, &headers, audience).await,
        },
    };
    let claims = match claims {
        Ok(c) => c,
        Err(e) => return e.to_http_response().into_response(),
    };

    ws.on_upgrade(move |socket| handle_connection(state, socket, claims.sub))
        .into_response()
}

/// Tracks one session attached through this connection.
struct Attachment {
    pump: tokio::task::JoinHandle<()>,
}

impl Attachment {
    fn detach(self) {
        self.pump.abort();
    }
}

async fn handle_connection(state: Arc<AppState>, socket: WebSocket, user_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);

    // Dedicated writer: everything this connection sends funnels through
    // one bounded queue.
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut attachments: HashMap<String, Attachment> = HashMap::new();

    loop {
        let msg = tokio::select! {
            // Process shutdown closes every socket with a normal closure.
            _ = state.shutdown.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(m)) => m,
                Some(Err(_)) | None => break,
            },
        };
        match msg {
            Message::Text(text) => {
                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(_) => {
                        let _ = out_tx.send(ServerMessage::error("invalid message")).await;
                        continue;
                    }
                };
                state.idle.record_activity();
                if let Some(reply) =
                    handle_client_message(&state, &user_id, client_msg, &out_tx, &mut attachments)
                        .await
                {
                    if out_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // The client going away must not tear sessions down; orphan them so
    // the grace period applies.
    for (id, attachment) in attachments.drain() {
        attachment.detach();
        if let Err(e) = state.manager.orphan_session(&id).await {
            debug!(session = %id, err = %e, "orphan on disconnect failed");
        }
    }

    // Dropping the last sender lets the writer flush and send a normal
    // closure frame; a stuck socket is abandoned after a short wait.
    drop(out_tx);
    if tokio::time::timeout(std::time::Duration::from_secs(2), &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn handle_client_message(
    state: &Arc<AppState>,
    user_id: &str,
    msg: ClientMessage,
    out_tx: &mpsc::Sender<ServerMessage>,
    attachments: &mut HashMap<String, Attachment>,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::CreateSession { id, rows, cols, work_dir } => {
            let work_dir = match resolve_work_dir(state, work_dir).await {
                Ok(dir) => dir,
                Err(e) => return Some(ServerMessage::error(e.message)),
            };
            let req = CreateSession {
                id,
                user_id: user_id.to_owned(),
                rows: rows.unwrap_or(0),
                cols: cols.unwrap_or(0),
                work_dir,
                env: Vec::new(),
            };
            match state.manager.create_session(req).await {
                Ok(session) => {
                    // Status precedes any output from the fresh PTY.
                    let _ = out_tx.send(ServerMessage::status(session.id(), "connected")).await;
                    attach(state, &session, out_tx, attachments).await;
                    None
                }
                Err(e) => Some(ServerMessage::error(e.message)),
            }
        }

        ClientMessage::Input { id, data } => {
            let Some(session) = state.manager.get_session(&id).await else {
                return Some(ServerMessage::error(format!("session {id} not found")));
            };
            let bytes = match base64::engine::general_purpose::STANDARD.decode(&data) {
                Ok(b) => b,
                Err(_) => return Some(ServerMessage::error("invalid base64 data")),
            };
            if let Err(e) = session.write(&bytes).await {
                return Some(ServerMessage::error(format!("write failed: {e}")));
            }
            None
        }

        ClientMessage::Resize { id, rows, cols } => {
            let Some(session) = state.manager.get_session(&id).await else {
                return Some(ServerMessage::error(format!("session {id} not found")));
            };
            match session.resize(rows, cols) {
                Ok(()) => None,
                Err(e) => Some(ServerMessage::error(format!("resize failed: {e}"))),
            }
        }

        ClientMessage::CloseSession { id } => {
            if let Some(attachment) = attachments.remove(&id) {
                attachment.detach();
            }
            match state.manager.close_session(&id).await {
                Ok(()) => Some(ServerMessage::status(id, "closed")),
                Err(e) => Some(ServerMessage::error(e.message)),
            }
        }

        ClientMessage::OrphanSession { id } => {
            if let Some(attachment) = attachments.remove(&id) {
                attachment.detach();
            }
            match state.manager.orphan_session(&id).await {
                Ok(()) => Some(ServerMessage::status(id, "orphaned")),
                Err(e) => Some(ServerMessage::error(e.message)),
            }
        }

        ClientMessage::ReattachSession { id } => {
            match state.manager.reattach_session(&id).await {
                Ok(session) => {
                    let _ = out_tx.send(ServerMessage::status(id.as_str(), "connected")).await;
                    attach(state, &session, out_tx, attachments).await;
                    None
                }
                Err(e) => Some(ServerMessage::error(e.message)),
            }
        }
    }
}

/// Wire a session's output into this connection.
///
/// The scrollback snapshot and the live writer are installed atomically by
/// `attach_writer`, so the replay frame always precedes live bytes without
/// duplicating them.
async fn attach(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    out_tx: &mpsc::Sender<ServerMessage>,
    attachments: &mut HashMap<String, Attachment>,
) {
    let id = session.id().to_owned();
    if let Some(previous) = attachments.remove(&id) {
        previous.detach();
    }

    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(SESSION_QUEUE);
    let scrollback = session.attach_writer(event_tx);
    if !scrollback.is_empty() {
        let _ = out_tx
            .send(ServerMessage::Output {
                id: id.clone(),
                data: base64::engine::general_purpose::STANDARD.encode(&scrollback),
            })
            .await;
    }

    let idle = Arc::clone(&state.idle);
    let out = out_tx.clone();
    let pump_id = id.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let msg = match event {
                SessionEvent::Output(bytes) => {
                    idle.record_activity();
                    ServerMessage::Output {
                        id: pump_id.clone(),
                        data: base64::engine::general_purpose::STANDARD.encode(&bytes),
                    }
                }
                SessionEvent::Exited { code } => {
                    let _ = out
                        .send(ServerMessage::Status {
                            id: pump_id.clone(),
                            status: "exited".to_owned(),
                            exit_code: code,
                            message: None,
                        })
                        .await;
                    break;
                }
            };
            if out.send(msg).await.is_err() {
                break;
            }
        }
    });

    attachments.insert(id, Attachment { pump });
}

async fn resolve_work_dir(
    state: &Arc<AppState>,
    work_dir: Option<String>,
) -> Result<Option<PathBuf>, crate::error::AgentError> {
    let Some(dir) = work_dir else {
        return Ok(None);
    };
    let path = PathBuf::from(&dir);
    if !path.is_absolute() || dir.split('/').any(|c| c == "..") {
        return Err(crate::error::AgentError::new(
            crate::error::ErrorCode::BadRequest,
            "workDir must be an absolute path without traversal",
        ));
    }
    // A path under the worktrees root must name a real worktree.
    if dir.contains("/.worktrees/") {
        return state.worktrees.validate(&dir).await.map(Some);
    }
    Ok(Some(path))
}
