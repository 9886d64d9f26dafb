// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Idle detection and control-plane heartbeats.
//!
//! Two independent loops share one activity watermark: the idle-check loop
//! shuts the VM down when no activity has been recorded for `timeout`, and
//! the heartbeat loop reports liveness upstream and obeys remote shutdown
//! directives. Shutdown is a `CancellationToken` cancelled at most once;
//! everything else keys off that.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{ControlPlaneClient, HeartbeatBody};

#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// Idle threshold before local shutdown. Zero disables the local check.
    pub timeout: Duration,
    pub heartbeat_interval: Duration,
    pub idle_check_interval: Duration,
}

struct Watermark {
    instant: Instant,
    at: DateTime<Utc>,
    /// Set by `record_activity`, cleared by the heartbeat loop.
    since_heartbeat: bool,
}

/// Optional metrics enrichment for heartbeat bodies.
pub type MetricsFn = Arc<dyn Fn() -> Option<(f64, f64, f64)> + Send + Sync>;

pub struct IdleDetector {
    config: IdleConfig,
    watermark: Mutex<Watermark>,
    /// Cancelled exactly once to trigger coordinated shutdown.
    shutdown: CancellationToken,
    /// Stops the loops without triggering shutdown (used in teardown).
    loops: CancellationToken,
}

impl IdleDetector {
    pub fn new(config: IdleConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            watermark: Mutex::new(Watermark {
                instant: Instant::now(),
                at: Utc::now(),
                since_heartbeat: false,
            }),
            shutdown: CancellationToken::new(),
            loops: CancellationToken::new(),
        })
    }

    /// Record activity now. The watermark never moves backwards.
    pub fn record_activity(&self) {
        let mut mark = self.watermark.lock();
        let now = Instant::now();
        if now > mark.instant {
            mark.instant = now;
            mark.at = Utc::now();
        }
        mark.since_heartbeat = true;
    }

    pub fn last_activity(&self) -> Instant {
        self.watermark.lock().instant
    }

    pub fn idle_for(&self) -> Duration {
        self.watermark.lock().instant.elapsed()
    }

    /// Token cancelled when shutdown is decided, locally or remotely.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Force shutdown (SIGTERM path shares the single-fire discipline).
    pub fn trigger_shutdown(&self, reason: &str) {
        if !self.shutdown.is_cancelled() {
            info!(reason, "shutdown triggered");
        }
        self.shutdown.cancel();
    }

    /// Stop both loops without firing shutdown.
    pub fn stop(&self) {
        self.loops.cancel();
    }

    /// Launch the idle-check and heartbeat loops.
    pub fn start(self: &Arc<Self>, control: Option<Arc<ControlPlaneClient>>, metrics: Option<MetricsFn>) {
        self.spawn_idle_check();
        if let Some(control) = control {
            self.spawn_heartbeat(control, metrics);
        }
    }

    fn spawn_idle_check(self: &Arc<Self>) {
        if self.config.timeout.is_zero() {
            return;
        }
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(detector.config.idle_check_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = detector.loops.cancelled() => break,
                    _ = detector.shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let idle = detector.idle_for();
                if idle > detector.config.timeout {
                    detector.trigger_shutdown("idle timeout");
                    break;
                }
            }
        });
    }

    fn spawn_heartbeat(self: &Arc<Self>, control: Arc<ControlPlaneClient>, metrics: Option<MetricsFn>) {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(detector.config.heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = detector.loops.cancelled() => break,
                    _ = detector.shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }

                let body = detector.heartbeat_body(metrics.as_ref());
                match control.heartbeat(&body).await {
                    Ok(resp) if resp.wants_shutdown() => {
                        detector.trigger_shutdown("control plane directive");
                        break;
                    }
                    Ok(resp) => {
                        debug!(action = %resp.action, "heartbeat acknowledged");
                    }
                    // Non-fatal: the next tick retries.
                    Err(e) => warn!(err = %e, "heartbeat failed"),
                }
            }
        });
    }

    fn heartbeat_body(&self, metrics: Option<&MetricsFn>) -> HeartbeatBody {
        let (idle_for, last_at, has_activity) = {
            let mut mark = self.watermark.lock();
            let had = mark.since_heartbeat;
            mark.since_heartbeat = false;
            (mark.instant.elapsed(), mark.at, had)
        };
        let (load1, mem, disk) = metrics
            .and_then(|f| f())
            .map(|(l, m, d)| (Some(l), Some(m), Some(d)))
            .unwrap_or((None, None, None));
        HeartbeatBody {
            idle_seconds: idle_for.as_secs(),
            idle: !self.config.timeout.is_zero() && idle_for > self.config.timeout,
            last_activity_at: last_at,
            has_activity: Some(has_activity),
            load1,
            mem_percent: mem,
            disk_percent: disk,
        }
    }
}

#[cfg(test)]
#[path = "idle_tests.rs"]
mod tests;
