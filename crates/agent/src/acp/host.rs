// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bridges one agent subprocess to many browser viewers.
//!
//! The host owns the subprocess and the viewer set. Agent events fan out to
//! every viewer in arrival order; prompts fan in serialized, one turn in
//! flight at a time. A rolling transcript lets a late viewer replay the
//! conversation before live events resume, with no gap and no duplicate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AgentError, ErrorCode};
use crate::manager::ActivityCallback;

use super::proto::{
    CancelParams, ClientInfo, Incoming, InitializeParams, LoadSessionParams, NewSessionParams,
    PermissionMode, PromptParams, Request, Response, RpcError, SessionResult,
};
use super::registry::{AgentKind, Credential};

/// Upper bound on transcript frames retained for replay.
const TRANSCRIPT_CAP: usize = 1024;

/// Per-viewer event queue depth. A viewer that cannot drain this many
/// events is disconnected rather than allowed to block the others.
const VIEWER_QUEUE: usize = 256;

/// Live host status, more granular than anything persisted upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Idle,
    Starting,
    Ready,
    Prompting,
    Error,
    Stopped,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Prompting => "prompting",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

/// Event delivered to viewers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    /// Agent notification, forwarded verbatim (unknown methods included).
    Event { method: String, params: Value },
    /// Status transition.
    Status { status: HostStatus },
    /// Tool-call approval forwarded to viewers in `default` mode.
    PermissionRequest { id: Value, params: Value },
    Error { message: String },
}

/// Snapshot reported upstream and over REST.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub session_id: String,
    pub agent: AgentKind,
    pub status: HostStatus,
    pub viewer_count: usize,
    pub cwd: String,
}

#[derive(Clone)]
pub struct HostConfig {
    pub agent: AgentKind,
    /// Working directory: the active worktree or the workspace root.
    pub cwd: PathBuf,
    pub permission_mode: PermissionMode,
    pub credential: Option<Credential>,
    /// Resume an existing agent session via `loadSession`.
    pub resume_session: Option<String>,
    /// How long the host survives with zero viewers and no turn in flight.
    pub idle_grace: Duration,
    pub on_activity: Option<ActivityCallback>,
}

struct Shared {
    transcript: Vec<HostEvent>,
    viewers: HashMap<u64, mpsc::Sender<HostEvent>>,
}

pub struct AcpHost {
    config: HostConfig,
    session_id: RwLock<Option<String>>,
    status: RwLock<HostStatus>,
    shared: Mutex<Shared>,
    next_viewer: AtomicU64,
    next_request: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>,
    outbound: mpsc::Sender<String>,
    prompting: AtomicBool,
    prompt_gate: tokio::sync::Mutex<()>,
    idle_cancel: Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
}

impl AcpHost {
    /// Spawn the agent subprocess and complete the session handshake.
    pub async fn start(config: HostConfig) -> Result<Arc<Self>, AgentError> {
        let (bin, args) = config.agent.command();
        let mut cmd = tokio::process::Command::new(bin);
        cmd.args(args)
            .current_dir(&config.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cred) = &config.credential {
            cmd.env(config.agent.credential_env(cred.kind), &cred.value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::new(ErrorCode::Internal, format!("failed to spawn {bin}: {e}"))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            AgentError::new(ErrorCode::Internal, "agent stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AgentError::new(ErrorCode::Internal, "agent stdout unavailable")
        })?;
        let stderr = child.stderr.take();

        let host = Self::connect(stdout, stdin, config);

        // Agent stderr is diagnostic only; keep a tail in the log.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!(target: "acp", "agent stderr: {line}");
                    }
                }
            });
        }

        // Watch the subprocess; an exit the host did not ask for is an error.
        let watcher = Arc::clone(&host);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    if !watcher.cancel.is_cancelled() {
                        let detail = match status {
                            Ok(s) => format!("agent subprocess exited: {s}"),
                            Err(e) => format!("agent subprocess wait failed: {e}"),
                        };
                        watcher.fail(detail);
                    }
                }
                _ = watcher.cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        });

        if let Err(e) = host.handshake().await {
            host.stop();
            return Err(e);
        }
        Ok(host)
    }

    /// Wire the host over an arbitrary reader/writer pair.
    ///
    /// Production uses the subprocess stdio; tests drive this with an
    /// in-process duplex stream standing in for the agent.
    pub fn connect<R, W>(reader: R, writer: W, config: HostConfig) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel::<String>(64);
        let host = Arc::new(Self {
            config,
            session_id: RwLock::new(None),
            status: RwLock::new(HostStatus::Starting),
            shared: Mutex::new(Shared { transcript: Vec::new(), viewers: HashMap::new() }),
            next_viewer: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
            prompting: AtomicBool::new(false),
            prompt_gate: tokio::sync::Mutex::new(()),
            idle_cancel: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        host.spawn_writer(writer, outbound_rx);
        host.spawn_reader(reader);
        host
    }

    fn spawn_writer(self: &Arc<Self>, mut writer: impl AsyncWrite + Unpin + Send + 'static, mut rx: mpsc::Receiver<String>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = rx.recv() => match line {
                        Some(l) => l,
                        None => break,
                    },
                };
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });
    }

    fn spawn_reader(self: &Arc<Self>, reader: impl AsyncRead + Unpin + Send + 'static) {
        let host = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = tokio::select! {
                    _ = host.cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Incoming>(&line) {
                            Ok(frame) => host.dispatch(frame),
                            Err(e) => {
                                host.fail(format!("undecodable agent frame: {e}"));
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if !host.cancel.is_cancelled() {
                            host.fail(format!("agent stream read failed: {e}"));
                        }
                        break;
                    }
                }
            }
        });
    }

    /// `initialize`, then `newSession` (or `loadSession` when resuming).
    async fn handshake(self: &Arc<Self>) -> Result<(), AgentError> {
        let init = InitializeParams {
            protocol_version: 1,
            client_info: ClientInfo {
                name: "vm-agent".to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
        };
        self.request("initialize", serde_json::to_value(init).ok()).await?;

        let cwd = self.config.cwd.display().to_string();
        let result = match &self.config.resume_session {
            Some(session_id) => {
                let params = LoadSessionParams { session_id: session_id.clone(), cwd };
                self.request("loadSession", serde_json::to_value(params).ok()).await?
            }
            None => {
                let params = NewSessionParams {
                    cwd,
                    permission_mode: self.config.permission_mode,
                    env: None,
                };
                self.request("newSession", serde_json::to_value(params).ok()).await?
            }
        };

        let session: SessionResult = serde_json::from_value(result).map_err(|e| {
            self.fail(format!("malformed session result: {e}"));
            AgentError::new(ErrorCode::Upstream, "agent returned a malformed session result")
        })?;
        *self.session_id.write() = Some(session.session_id.clone());
        self.set_status(HostStatus::Ready);
        info!(session = %session.session_id, agent = %self.config.agent, "agent session ready");
        Ok(())
    }

    /// Issue one request and wait for its reply.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, AgentError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = Request::new(id, method, params);
        let line = serde_json::to_string(&frame)
            .map_err(|e| AgentError::new(ErrorCode::Internal, format!("encode {method}: {e}")))?;
        if self.outbound.send(line).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(AgentError::new(ErrorCode::Upstream, "agent connection closed"));
        }

        let reply = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pending.lock().remove(&id);
                return Err(AgentError::new(ErrorCode::Upstream, "agent session stopped"));
            }
            reply = rx => reply,
        };

        match reply {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(rpc)) => Err(AgentError::new(ErrorCode::Upstream, rpc.to_string())),
            Err(_) => Err(AgentError::new(ErrorCode::Upstream, "agent reply channel dropped")),
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Incoming) {
        if let Some(cb) = &self.config.on_activity {
            cb();
        }

        if frame.is_reply() {
            let id = frame.id.as_ref().and_then(Value::as_u64);
            if let Some(tx) = id.and_then(|id| self.pending.lock().remove(&id)) {
                let outcome = match frame.error {
                    Some(err) => Err(err),
                    None => Ok(frame.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            return;
        }

        if frame.is_request() {
            let id = frame.id.clone().unwrap_or(Value::Null);
            self.handle_agent_request(id, frame.method.unwrap_or_default(), frame.params);
            return;
        }

        if let Some(method) = frame.method {
            // Notification: record and fan out verbatim, known or not.
            self.broadcast(HostEvent::Event {
                method,
                params: frame.params.unwrap_or(Value::Null),
            });
        }
    }

    /// Apply the tool-approval policy to an agent-initiated request.
    fn handle_agent_request(self: &Arc<Self>, id: Value, method: String, params: Option<Value>) {
        let params = params.unwrap_or(Value::Null);
        let decision = match self.config.permission_mode {
            PermissionMode::BypassPermissions => Some(true),
            PermissionMode::AcceptEdits if is_edit_request(&params) => Some(true),
            PermissionMode::AcceptEdits => None,
            PermissionMode::Plan | PermissionMode::DontAsk => Some(false),
            PermissionMode::Default => None,
        };

        match decision {
            Some(approved) => self.reply_permission(id, approved),
            None => {
                debug!(method = %method, "forwarding approval request to viewers");
                self.broadcast(HostEvent::PermissionRequest { id, params });
            }
        }
    }

    /// Resolve a forwarded approval request (from a viewer).
    pub fn respond_permission(&self, id: Value, approved: bool) {
        self.reply_permission(id, approved);
    }

    fn reply_permission(&self, id: Value, approved: bool) {
        let resp = Response::ok(id, serde_json::json!({ "approved": approved }));
        if let Ok(line) = serde_json::to_string(&resp) {
            let outbound = self.outbound.clone();
            tokio::spawn(async move {
                let _ = outbound.send(line).await;
            });
        }
    }

    /// Submit a user prompt. Prompts from all viewers are serialized here;
    /// exactly one is in flight at a time.
    pub async fn prompt(&self, content: Value) -> Result<Value, AgentError> {
        let _turn = self.prompt_gate.lock().await;

        match self.status() {
            HostStatus::Ready | HostStatus::Idle => {}
            status => {
                return Err(AgentError::new(
                    ErrorCode::Conflict,
                    format!("agent session is {}", status.as_str()),
                ));
            }
        }
        let session_id = self.session_id().ok_or_else(|| {
            AgentError::new(ErrorCode::Conflict, "agent session not established")
        })?;

        self.prompting.store(true, Ordering::Release);
        self.set_status(HostStatus::Prompting);

        let params = PromptParams { session_id, content };
        let result = self.request("prompt", serde_json::to_value(params).ok()).await;

        self.prompting.store(false, Ordering::Release);
        if self.status() == HostStatus::Prompting {
            self.set_status(HostStatus::Ready);
        }
        result
    }

    /// Kick off idle teardown if the turn ended with nobody watching.
    pub fn maybe_idle_stop(self: &Arc<Self>) {
        if self.viewer_count() == 0 && !self.prompting.load(Ordering::Acquire) {
            self.schedule_idle_stop();
        }
    }

    /// Cancel the in-flight turn, if any.
    pub async fn cancel_turn(&self) -> Result<(), AgentError> {
        let session_id = self.session_id().ok_or_else(|| {
            AgentError::new(ErrorCode::Conflict, "agent session not established")
        })?;
        let params = CancelParams { session_id };
        self.request("cancel", serde_json::to_value(params).ok()).await.map(|_| ())
    }

    // -- Viewers --------------------------------------------------------------

    /// Register a viewer.
    ///
    /// Returns the viewer id, its event receiver, and the transcript
    /// snapshot to replay before live events. The snapshot and the
    /// receiver are created under one lock, so the two streams compose
    /// without gaps or duplicates.
    pub fn add_viewer(&self) -> (u64, mpsc::Receiver<HostEvent>, Vec<HostEvent>) {
        if let Some(token) = self.idle_cancel.lock().take() {
            token.cancel();
        }
        let id = self.next_viewer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE);
        let mut shared = self.shared.lock();
        let snapshot = shared.transcript.clone();
        shared.viewers.insert(id, tx);
        (id, rx, snapshot)
    }

    pub fn remove_viewer(self: &Arc<Self>, viewer_id: u64) {
        let remaining = {
            let mut shared = self.shared.lock();
            shared.viewers.remove(&viewer_id);
            shared.viewers.len()
        };
        if remaining == 0 && !self.prompting.load(Ordering::Acquire) {
            self.schedule_idle_stop();
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.shared.lock().viewers.len()
    }

    /// Stop the host after the idle grace unless a viewer returns.
    fn schedule_idle_stop(self: &Arc<Self>) {
        if matches!(self.status(), HostStatus::Stopped | HostStatus::Error) {
            return;
        }
        let token = CancellationToken::new();
        if let Some(prev) = self.idle_cancel.lock().replace(token.clone()) {
            prev.cancel();
        }
        self.set_status(HostStatus::Idle);

        let host = Arc::clone(self);
        let grace = self.config.idle_grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    // A viewer reattached; leave idle state.
                    if host.status() == HostStatus::Idle {
                        host.set_status(HostStatus::Ready);
                    }
                }
                _ = tokio::time::sleep(grace) => {
                    info!(session = ?host.session_id(), "no viewers after grace, stopping agent session");
                    host.stop();
                }
            }
        });
    }

    // -- Lifecycle ------------------------------------------------------------

    pub fn status(&self) -> HostStatus {
        *self.status.read()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn info(&self) -> HostInfo {
        HostInfo {
            session_id: self.session_id().unwrap_or_default(),
            agent: self.config.agent,
            status: self.status(),
            viewer_count: self.viewer_count(),
            cwd: self.config.cwd.display().to_string(),
        }
    }

    fn set_status(&self, status: HostStatus) {
        *self.status.write() = status;
        self.broadcast(HostEvent::Status { status });
    }

    /// Transition to `error`: broadcast, refuse further prompts, and wait
    /// for an explicit stop.
    fn fail(&self, message: String) {
        warn!(session = ?self.session_id(), "{message}");
        {
            let mut status = self.status.write();
            if matches!(*status, HostStatus::Stopped) {
                return;
            }
            *status = HostStatus::Error;
        }
        self.broadcast(HostEvent::Error { message });
        self.broadcast(HostEvent::Status { status: HostStatus::Error });
        // Unblock any in-flight request.
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(RpcError {
                code: -32000,
                message: "agent session failed".to_owned(),
                data: None,
            }));
        }
    }

    /// Terminal stop: kill the subprocess and drop all viewers.
    pub fn stop(&self) {
        {
            let mut status = self.status.write();
            if matches!(*status, HostStatus::Stopped) {
                return;
            }
            *status = HostStatus::Stopped;
        }
        self.broadcast(HostEvent::Status { status: HostStatus::Stopped });
        self.cancel.cancel();
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(RpcError {
                code: -32000,
                message: "agent session stopped".to_owned(),
                data: None,
            }));
        }
        self.shared.lock().viewers.clear();
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.status(), HostStatus::Stopped)
    }

    /// Record an event and fan it out to every viewer in order.
    ///
    /// The viewer list is snapshotted under the lock but queue writes
    /// happen outside it; a viewer with a full queue is dropped rather
    /// than allowed to stall the rest.
    fn broadcast(&self, event: HostEvent) {
        let targets: Vec<(u64, mpsc::Sender<HostEvent>)> = {
            let mut shared = self.shared.lock();
            if matches!(event, HostEvent::Event { .. } | HostEvent::PermissionRequest { .. }) {
                shared.transcript.push(event.clone());
                if shared.transcript.len() > TRANSCRIPT_CAP {
                    let excess = shared.transcript.len() - TRANSCRIPT_CAP;
                    shared.transcript.drain(..excess);
                }
            }
            shared.viewers.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(viewer = id, "viewer queue full, disconnecting");
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            let mut shared = self.shared.lock();
            for id in dead {
                shared.viewers.remove(&id);
            }
        }
    }
}

/// Whether an agent approval request concerns a file edit.
fn is_edit_request(params: &Value) -> bool {
    params
        .get("toolCall")
        .and_then(|tc| tc.get("kind"))
        .and_then(Value::as_str)
        .is_some_and(|k| k == "edit")
}

#[cfg(test)]
#[path = "host_tests.rs"]
mod tests;
