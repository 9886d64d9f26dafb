// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY sessions: one shell bound to one pseudo-terminal, with scrollback
//! and detach/reattach support.

pub mod spawn;

pub use spawn::{ContainerExec, SpawnSpec};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ring::RingBuffer;
use spawn::PtyHandle;

/// Read chunk size for the output reader loop.
const READ_CHUNK: usize = 4096;

/// Event delivered to a session's attached writer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Output(Bytes),
    Exited { code: Option<i32> },
}

/// The single mirror sink for a session's output, typically the WebSocket
/// bridge's per-session queue.
pub type AttachedWriter = mpsc::Sender<SessionEvent>;

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub id: String,
    pub user_id: String,
    pub shell: String,
    pub rows: u16,
    pub cols: u16,
    pub work_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub container: Option<ContainerExec>,
    pub ring_capacity: usize,
}

/// Read-only snapshot of a session for listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub working_directory: Option<String>,
}

struct OutputState {
    ring: RingBuffer,
    attached: Option<AttachedWriter>,
}

struct ActivityStamp {
    instant: Instant,
    at: DateTime<Utc>,
}

/// One shell bound to one PTY, possibly through a container exec.
///
/// The owning [`Manager`](crate::manager::Manager) is the only component
/// that creates and closes sessions; everything else holds `Arc<Session>`
/// snapshots obtained from it.
pub struct Session {
    id: String,
    user_id: String,
    created_at: DateTime<Utc>,
    work_dir: Option<PathBuf>,
    name: Mutex<Option<String>>,
    pty: PtyHandle,
    rows: AtomicU16,
    cols: AtomicU16,
    output: Mutex<OutputState>,
    /// Serializes PTY writes from concurrent viewers.
    write_gate: tokio::sync::Mutex<()>,
    activity: Mutex<ActivityStamp>,
    process_exited: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    closed: AtomicBool,
    orphaned: AtomicBool,
    orphaned_at: Mutex<Option<Instant>>,
    orphan_cancel: Mutex<Option<CancellationToken>>,
}

impl Session {
    /// Spawn the shell on a fresh PTY. On failure no session exists.
    pub fn spawn(cfg: SessionConfig) -> anyhow::Result<Arc<Self>> {
        let spec = SpawnSpec {
            shell: cfg.shell,
            container: cfg.container,
            work_dir: cfg.work_dir.clone(),
            env: cfg.env,
        };
        let pty = spawn::spawn_pty(&spec, cfg.rows, cfg.cols)?;
        let now = Instant::now();
        Ok(Arc::new(Self {
            id: cfg.id,
            user_id: cfg.user_id,
            created_at: Utc::now(),
            work_dir: cfg.work_dir,
            name: Mutex::new(None),
            pty,
            rows: AtomicU16::new(cfg.rows),
            cols: AtomicU16::new(cfg.cols),
            output: Mutex::new(OutputState {
                ring: RingBuffer::new(cfg.ring_capacity),
                attached: None,
            }),
            write_gate: tokio::sync::Mutex::new(()),
            activity: Mutex::new(ActivityStamp { instant: now, at: Utc::now() }),
            process_exited: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            closed: AtomicBool::new(false),
            orphaned: AtomicBool::new(false),
            orphaned_at: Mutex::new(None),
            orphan_cancel: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = Some(name.into());
    }

    pub fn rows(&self) -> u16 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn cols(&self) -> u16 {
        self.cols.load(Ordering::Relaxed)
    }

    pub fn process_exited(&self) -> bool {
        self.process_exited.load(Ordering::Acquire)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Write bytes to the PTY. Concurrent writers are serialized.
    pub async fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        let _gate = self.write_gate.lock().await;
        self.pty.write(data).await?;
        self.touch();
        Ok(())
    }

    /// Store the new window size and apply it with `TIOCSWINSZ`.
    pub fn resize(&self, rows: u16, cols: u16) -> anyhow::Result<()> {
        self.rows.store(rows, Ordering::Relaxed);
        self.cols.store(cols, Ordering::Relaxed);
        self.pty.set_winsize(rows, cols)
    }

    /// Install (or clear) the attached writer.
    ///
    /// Returns the current scrollback so the caller can replay it before
    /// live bytes resume; the swap is atomic with respect to buffered
    /// output, so replay-then-live has no gap and no duplicate.
    pub fn attach_writer(&self, writer: AttachedWriter) -> Vec<u8> {
        let mut out = self.output.lock();
        let scrollback = out.ring.read_all();
        out.attached = Some(writer);
        scrollback
    }

    pub fn detach_writer(&self) {
        self.output.lock().attached = None;
    }

    pub fn attached_writer(&self) -> Option<AttachedWriter> {
        self.output.lock().attached.clone()
    }

    /// Current scrollback contents.
    pub fn scrollback(&self) -> Vec<u8> {
        self.output.lock().ring.read_all()
    }

    /// Snapshot for listing.
    pub fn info(&self) -> SessionInfo {
        let status = if self.process_exited() { "exited" } else { "running" };
        SessionInfo {
            id: self.id.clone(),
            name: self.name(),
            status: status.to_owned(),
            created_at: self.created_at,
            last_activity_at: self.activity.lock().at,
            working_directory: self.work_dir.as_ref().map(|p| p.display().to_string()),
        }
    }

    /// Time since the last read or write on this session.
    pub fn idle_time(&self) -> Duration {
        self.activity.lock().instant.elapsed()
    }

    pub fn last_activity(&self) -> Instant {
        self.activity.lock().instant
    }

    /// Advance the activity watermark. Never moves backwards.
    fn touch(&self) {
        let mut stamp = self.activity.lock();
        let now = Instant::now();
        if now > stamp.instant {
            stamp.instant = now;
            stamp.at = Utc::now();
        }
    }

    /// Start the dedicated output reader.
    ///
    /// For every chunk the reader stamps activity, appends to the ring
    /// buffer, invokes `on_output`, and mirrors to the attached writer if
    /// one is installed. On read error it records the exit, notifies the
    /// attached writer, invokes `on_exit`, and terminates.
    pub fn start_output_reader(
        self: &Arc<Self>,
        on_output: Arc<dyn Fn(&str, &[u8]) + Send + Sync>,
        on_exit: Arc<dyn Fn(&str) + Send + Sync>,
    ) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match session.pty.read(&mut buf).await {
                    Ok(Some(n)) => {
                        session.touch();
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        let writer = {
                            let mut out = session.output.lock();
                            out.ring.write(&chunk);
                            out.attached.clone()
                        };
                        on_output(&session.id, &chunk);
                        if let Some(tx) = writer {
                            // A closed receiver means the viewer is gone; the
                            // manager will orphan the session separately.
                            let _ = tx.send(SessionEvent::Output(chunk)).await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(session = %session.id, err = %e, "pty read failed");
                        break;
                    }
                }
            }

            let code = session.reap().await;
            session.process_exited.store(true, Ordering::Release);
            *session.exit_code.lock() = code;
            debug!(session = %session.id, code = ?code, "session process exited");

            let writer = session.output.lock().attached.clone();
            if let Some(tx) = writer {
                let _ = tx.send(SessionEvent::Exited { code }).await;
            }
            on_exit(&session.id);
        });
    }

    /// Reap the child and return its exit code, off the async runtime.
    async fn reap(&self) -> Option<i32> {
        if let Some(code) = self.pty.try_exit_code() {
            return Some(code);
        }
        let pid = self.pty.child;
        tokio::task::spawn_blocking(move || spawn::wait_for_exit(pid))
            .await
            .ok()
            .flatten()
    }

    /// Close the PTY: kill and reap the process if still running.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(token) = self.orphan_cancel.lock().take() {
            token.cancel();
        }
        if !self.process_exited() {
            self.pty.terminate();
        }
    }

    // -- Orphan bookkeeping (driven by the Manager) --------------------------

    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }

    pub fn orphaned_at(&self) -> Option<Instant> {
        *self.orphaned_at.lock()
    }

    pub(crate) fn mark_orphaned(&self, cancel: CancellationToken) {
        self.detach_writer();
        self.orphaned.store(true, Ordering::Release);
        *self.orphaned_at.lock() = Some(Instant::now());
        if let Some(prev) = self.orphan_cancel.lock().replace(cancel) {
            prev.cancel();
        }
    }

    pub(crate) fn clear_orphaned(&self) {
        self.orphaned.store(false, Ordering::Release);
        *self.orphaned_at.lock() = None;
        if let Some(token) = self.orphan_cancel.lock().take() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("exited", &self.process_exited())
            .field("orphaned", &self.is_orphaned())
            .finish()
    }
}
