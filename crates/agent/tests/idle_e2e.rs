// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end idle detection against a mock control plane.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::Json;

use vm_agent::control::ControlPlaneClient;
use vm_agent::idle::{IdleConfig, IdleDetector};

struct MockControlPlane {
    heartbeats: AtomicUsize,
    action: &'static str,
}

async fn heartbeat_handler(
    State(mock): State<Arc<MockControlPlane>>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    mock.heartbeats.fetch_add(1, Ordering::Relaxed);
    assert!(body["idleSeconds"].is_number());
    assert!(body["idle"].is_boolean());
    assert!(body["lastActivityAt"].is_string());
    Json(serde_json::json!({
        "action": mock.action,
        "idleSeconds": body["idleSeconds"],
        "maxIdleSeconds": 1800,
        "shutdownDeadline": null,
    }))
}

async fn spawn_mock(
    action: &'static str,
) -> anyhow::Result<(Arc<MockControlPlane>, Arc<ControlPlaneClient>)> {
    let mock = Arc::new(MockControlPlane { heartbeats: AtomicUsize::new(0), action });
    let router = axum::Router::new()
        .route("/api/workspaces/{id}/heartbeat", post(heartbeat_handler))
        .with_state(Arc::clone(&mock));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let client = Arc::new(ControlPlaneClient::new(
        format!("http://{addr}"),
        "ws-abc123",
        Some("cbt-test".to_owned()),
    ));
    Ok((mock, client))
}

fn fast_config() -> IdleConfig {
    IdleConfig {
        timeout: Duration::from_millis(150),
        heartbeat_interval: Duration::from_millis(50),
        idle_check_interval: Duration::from_millis(30),
    }
}

#[tokio::test]
async fn idle_shutdown_with_no_activity() -> anyhow::Result<()> {
    let (mock, client) = spawn_mock("continue").await?;
    let detector = IdleDetector::new(fast_config());
    detector.start(Some(client), None);

    let token = detector.shutdown_token();
    tokio::time::timeout(Duration::from_secs(1), token.cancelled())
        .await
        .map_err(|_| anyhow::anyhow!("no shutdown within 1s"))?;

    assert!(mock.heartbeats.load(Ordering::Relaxed) >= 1, "no heartbeat was received");
    Ok(())
}

#[tokio::test]
async fn active_then_idle() -> anyhow::Result<()> {
    let (_mock, client) = spawn_mock("continue").await?;
    let detector = IdleDetector::new(fast_config());
    detector.start(Some(client), None);
    let token = detector.shutdown_token();

    // Activity every 40ms for 200ms keeps the VM alive.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        detector.record_activity();
        assert!(!token.is_cancelled(), "shutdown fired during activity");
    }
    let stopped_at = tokio::time::Instant::now();

    tokio::time::timeout(Duration::from_millis(600), token.cancelled())
        .await
        .map_err(|_| anyhow::anyhow!("no shutdown after activity ceased"))?;

    // Roughly one timeout after the last activity (generous upper bound
    // for scheduling noise).
    let elapsed = stopped_at.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "shutdown too early: {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn forced_remote_shutdown() -> anyhow::Result<()> {
    let (_mock, client) = spawn_mock("shutdown").await?;
    // Local idle detection effectively disabled.
    let detector = IdleDetector::new(IdleConfig {
        timeout: Duration::from_secs(3600),
        heartbeat_interval: Duration::from_millis(50),
        idle_check_interval: Duration::from_secs(3600),
    });
    detector.start(Some(client), None);

    let token = detector.shutdown_token();
    tokio::time::timeout(Duration::from_millis(500), token.cancelled())
        .await
        .map_err(|_| anyhow::anyhow!("remote shutdown directive ignored"))?;
    Ok(())
}

#[tokio::test]
async fn heartbeat_failures_are_non_fatal() -> anyhow::Result<()> {
    // Point at a dead port: every heartbeat fails, the loop keeps going,
    // and the local idle check still fires.
    let client = Arc::new(ControlPlaneClient::new(
        "http://127.0.0.1:9",
        "ws-abc123",
        Some("cbt-test".to_owned()),
    ));
    let detector = IdleDetector::new(fast_config());
    detector.start(Some(client), None);

    let token = detector.shutdown_token();
    tokio::time::timeout(Duration::from_secs(2), token.cancelled())
        .await
        .map_err(|_| anyhow::anyhow!("local idle check did not fire"))?;
    Ok(())
}
