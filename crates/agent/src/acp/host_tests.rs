// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Scripted stand-in for an agent subprocess, driven over a duplex pipe.
struct FakeAgent {
    /// Raw lines pushed verbatim to the host.
    inject: UnboundedSender<String>,
    /// Every frame the host sent us.
    seen: UnboundedReceiver<Value>,
}

async fn send_frame(w: &mut WriteHalf<tokio::io::DuplexStream>, frame: Value) {
    let mut line = frame.to_string();
    line.push('\n');
    let _ = w.write_all(line.as_bytes()).await;
}

async fn reply(w: &mut WriteHalf<tokio::io::DuplexStream>, id: Option<Value>, result: Value) {
    send_frame(w, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
}

async fn notify(w: &mut WriteHalf<tokio::io::DuplexStream>, method: &str, params: Value) {
    send_frame(w, json!({"jsonrpc": "2.0", "method": method, "params": params})).await;
}

fn spawn_fake_agent(stream: tokio::io::DuplexStream) -> FakeAgent {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (inject, mut inject_rx) = unbounded_channel::<String>();
    let (seen_tx, seen) = unbounded_channel::<Value>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                raw = inject_rx.recv() => {
                    let Some(raw) = raw else { break };
                    let _ = write_half.write_all(raw.as_bytes()).await;
                    let _ = write_half.write_all(b"\n").await;
                }
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    let Ok(v) = serde_json::from_str::<Value>(&line) else { continue };
                    let _ = seen_tx.send(v.clone());
                    let id = v.get("id").cloned();
                    match v.get("method").and_then(Value::as_str) {
                        Some("initialize") => {
                            reply(&mut write_half, id, json!({"protocolVersion": 1})).await;
                        }
                        Some("newSession") | Some("loadSession") => {
                            reply(&mut write_half, id, json!({"sessionId": "sess-test"})).await;
                        }
                        Some("prompt") => {
                            notify(&mut write_half, "session/update",
                                json!({"kind": "agent_message_chunk", "text": "tok1"})).await;
                            notify(&mut write_half, "session/update",
                                json!({"kind": "agent_message_chunk", "text": "tok2"})).await;
                            reply(&mut write_half, id, json!({"stopReason": "end_turn"})).await;
                        }
                        Some("cancel") => {
                            reply(&mut write_half, id, json!({})).await;
                        }
                        _ => {}
                    }
                }
            }
        }
    });

    FakeAgent { inject, seen }
}

fn test_config(mode: PermissionMode) -> HostConfig {
    HostConfig {
        agent: AgentKind::ClaudeCode,
        cwd: std::path::PathBuf::from("."),
        permission_mode: mode,
        credential: None,
        resume_session: None,
        idle_grace: Duration::from_secs(60),
        on_activity: None,
    }
}

async fn connected_host(mode: PermissionMode) -> anyhow::Result<(Arc<AcpHost>, FakeAgent)> {
    let (host_io, agent_io) = tokio::io::duplex(64 * 1024);
    let agent = spawn_fake_agent(agent_io);
    let (r, w) = tokio::io::split(host_io);
    let host = AcpHost::connect(r, w, test_config(mode));
    host.handshake().await.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok((host, agent))
}

async fn recv_event(
    rx: &mut tokio::sync::mpsc::Receiver<HostEvent>,
) -> anyhow::Result<HostEvent> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for event"))?
        .ok_or_else(|| anyhow::anyhow!("viewer channel closed"))
}

/// Skip status frames, returning the next agent event.
async fn next_agent_event(
    rx: &mut tokio::sync::mpsc::Receiver<HostEvent>,
) -> anyhow::Result<(String, Value)> {
    loop {
        match recv_event(rx).await? {
            HostEvent::Event { method, params } => return Ok((method, params)),
            HostEvent::Error { message } => anyhow::bail!("unexpected error event: {message}"),
            _ => continue,
        }
    }
}

fn chunk_text(params: &Value) -> Option<&str> {
    params.get("text").and_then(Value::as_str)
}

#[tokio::test]
async fn handshake_reaches_ready() -> anyhow::Result<()> {
    let (host, mut agent) = connected_host(PermissionMode::Default).await?;
    assert_eq!(host.status(), HostStatus::Ready);
    assert_eq!(host.session_id().as_deref(), Some("sess-test"));

    // The handshake is initialize then newSession, in that order.
    let first = agent.seen.recv().await.ok_or_else(|| anyhow::anyhow!("no frame"))?;
    assert_eq!(first["method"], "initialize");
    assert_eq!(first["params"]["protocolVersion"], 1);
    let second = agent.seen.recv().await.ok_or_else(|| anyhow::anyhow!("no frame"))?;
    assert_eq!(second["method"], "newSession");
    assert_eq!(second["params"]["permissionMode"], "default");
    Ok(())
}

#[tokio::test]
async fn resume_uses_load_session() -> anyhow::Result<()> {
    let (host_io, agent_io) = tokio::io::duplex(64 * 1024);
    let mut agent = spawn_fake_agent(agent_io);
    let (r, w) = tokio::io::split(host_io);
    let mut config = test_config(PermissionMode::Default);
    config.resume_session = Some("sess-old".to_owned());
    let host = AcpHost::connect(r, w, config);
    host.handshake().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let _init = agent.seen.recv().await;
    let frame = agent.seen.recv().await.ok_or_else(|| anyhow::anyhow!("no frame"))?;
    assert_eq!(frame["method"], "loadSession");
    assert_eq!(frame["params"]["sessionId"], "sess-old");
    assert_eq!(host.session_id().as_deref(), Some("sess-test"));
    Ok(())
}

#[tokio::test]
async fn prompt_fans_out_to_all_viewers_in_order() -> anyhow::Result<()> {
    let (host, _agent) = connected_host(PermissionMode::Default).await?;

    let (_v1, mut rx1, snap1) = host.add_viewer();
    let (_v2, mut rx2, snap2) = host.add_viewer();
    assert!(snap1.is_empty());
    assert!(snap2.is_empty());
    assert_eq!(host.viewer_count(), 2);

    let result = host.prompt(json!([{"type": "text", "text": "hello"}])).await;
    assert!(result.is_ok());

    for rx in [&mut rx1, &mut rx2] {
        let (method, params) = next_agent_event(rx).await?;
        assert_eq!(method, "session/update");
        assert_eq!(chunk_text(&params), Some("tok1"));
        let (_, params) = next_agent_event(rx).await?;
        assert_eq!(chunk_text(&params), Some("tok2"));
    }
    assert_eq!(host.status(), HostStatus::Ready);
    Ok(())
}

#[tokio::test]
async fn disconnected_viewer_stops_receiving_others_continue() -> anyhow::Result<()> {
    let (host, _agent) = connected_host(PermissionMode::Default).await?;

    let (v1, rx1, _) = host.add_viewer();
    let (_v2, mut rx2, _) = host.add_viewer();
    drop(rx1);
    host.remove_viewer(v1);
    assert_eq!(host.viewer_count(), 1);

    host.prompt(json!([{"type": "text", "text": "again"}]))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let (_, params) = next_agent_event(&mut rx2).await?;
    assert_eq!(chunk_text(&params), Some("tok1"));
    Ok(())
}

#[tokio::test]
async fn late_viewer_replays_transcript_without_gap() -> anyhow::Result<()> {
    let (host, _agent) = connected_host(PermissionMode::Default).await?;

    let (_v1, mut rx1, _) = host.add_viewer();
    host.prompt(json!([{"type": "text", "text": "hi"}]))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    // Drain v1 to make sure both tokens went out.
    next_agent_event(&mut rx1).await?;
    next_agent_event(&mut rx1).await?;

    let (_v2, _rx2, snapshot) = host.add_viewer();
    let texts: Vec<&str> = snapshot
        .iter()
        .filter_map(|e| match e {
            HostEvent::Event { params, .. } => chunk_text(params),
            _ => None,
        })
        .collect();
    assert_eq!(texts, ["tok1", "tok2"]);
    Ok(())
}

#[tokio::test]
async fn unknown_notification_is_forwarded_verbatim() -> anyhow::Result<()> {
    let (host, agent) = connected_host(PermissionMode::Default).await?;
    let (_v, mut rx, _) = host.add_viewer();

    agent
        .inject
        .send(r#"{"jsonrpc":"2.0","method":"session/experimental_usage","params":{"tokens":42}}"#.to_owned())
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let (method, params) = next_agent_event(&mut rx).await?;
    assert_eq!(method, "session/experimental_usage");
    assert_eq!(params["tokens"], 42);
    Ok(())
}

#[tokio::test]
async fn bypass_mode_auto_approves() -> anyhow::Result<()> {
    let (host, mut agent) = connected_host(PermissionMode::BypassPermissions).await?;
    let (_v, _rx, _) = host.add_viewer();

    // Drain handshake frames.
    let _ = agent.seen.recv().await;
    let _ = agent.seen.recv().await;

    agent
        .inject
        .send(
            r#"{"jsonrpc":"2.0","id":91,"method":"session/request_permission","params":{"toolCall":{"kind":"execute"}}}"#
                .to_owned(),
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let frame = tokio::time::timeout(Duration::from_secs(5), agent.seen.recv())
        .await
        .map_err(|_| anyhow::anyhow!("no approval reply"))?
        .ok_or_else(|| anyhow::anyhow!("agent pipe closed"))?;
    assert_eq!(frame["id"], 91);
    assert_eq!(frame["result"]["approved"], true);
    Ok(())
}

#[tokio::test]
async fn dont_ask_mode_auto_denies() -> anyhow::Result<()> {
    let (host, mut agent) = connected_host(PermissionMode::DontAsk).await?;
    let (_v, _rx, _) = host.add_viewer();
    let _ = agent.seen.recv().await;
    let _ = agent.seen.recv().await;

    agent
        .inject
        .send(
            r#"{"jsonrpc":"2.0","id":92,"method":"session/request_permission","params":{"toolCall":{"kind":"execute"}}}"#
                .to_owned(),
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let frame = tokio::time::timeout(Duration::from_secs(5), agent.seen.recv())
        .await
        .map_err(|_| anyhow::anyhow!("no denial reply"))?
        .ok_or_else(|| anyhow::anyhow!("agent pipe closed"))?;
    assert_eq!(frame["id"], 92);
    assert_eq!(frame["result"]["approved"], false);
    Ok(())
}

#[tokio::test]
async fn default_mode_forwards_permission_to_viewers() -> anyhow::Result<()> {
    let (host, agent) = connected_host(PermissionMode::Default).await?;
    let (_v, mut rx, _) = host.add_viewer();

    agent
        .inject
        .send(
            r#"{"jsonrpc":"2.0","id":93,"method":"session/request_permission","params":{"toolCall":{"kind":"edit"}}}"#
                .to_owned(),
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    loop {
        match recv_event(&mut rx).await? {
            HostEvent::PermissionRequest { id, params } => {
                assert_eq!(id, json!(93));
                assert_eq!(params["toolCall"]["kind"], "edit");
                return Ok(());
            }
            HostEvent::Error { message } => anyhow::bail!("unexpected error: {message}"),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn accept_edits_approves_edits_only() -> anyhow::Result<()> {
    let (host, mut agent) = connected_host(PermissionMode::AcceptEdits).await?;
    let (_v, mut rx, _) = host.add_viewer();
    let _ = agent.seen.recv().await;
    let _ = agent.seen.recv().await;

    agent
        .inject
        .send(
            r#"{"jsonrpc":"2.0","id":94,"method":"session/request_permission","params":{"toolCall":{"kind":"edit"}}}"#
                .to_owned(),
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let frame = tokio::time::timeout(Duration::from_secs(5), agent.seen.recv())
        .await
        .map_err(|_| anyhow::anyhow!("no reply"))?
        .ok_or_else(|| anyhow::anyhow!("pipe closed"))?;
    assert_eq!(frame["result"]["approved"], true);

    // Non-edit requests still go to the viewers.
    agent
        .inject
        .send(
            r#"{"jsonrpc":"2.0","id":95,"method":"session/request_permission","params":{"toolCall":{"kind":"execute"}}}"#
                .to_owned(),
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    loop {
        match recv_event(&mut rx).await? {
            HostEvent::PermissionRequest { id, .. } => {
                assert_eq!(id, json!(95));
                return Ok(());
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn undecodable_frame_fails_the_host() -> anyhow::Result<()> {
    let (host, agent) = connected_host(PermissionMode::Default).await?;

    agent
        .inject
        .send("this is not json".to_owned())
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    for _ in 0..50 {
        if host.status() == HostStatus::Error {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(host.status(), HostStatus::Error);

    let err = match host.prompt(json!([{"type": "text", "text": "x"}])).await {
        Err(e) => e,
        Ok(_) => anyhow::bail!("prompt accepted in error state"),
    };
    assert_eq!(err.code, crate::error::ErrorCode::Conflict);
    Ok(())
}

#[tokio::test]
async fn idle_grace_stops_host_after_last_viewer_leaves() -> anyhow::Result<()> {
    let (host_io, agent_io) = tokio::io::duplex(64 * 1024);
    let _agent = spawn_fake_agent(agent_io);
    let (r, w) = tokio::io::split(host_io);
    let mut config = test_config(PermissionMode::Default);
    config.idle_grace = Duration::from_millis(100);
    let host = AcpHost::connect(r, w, config);
    host.handshake().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let (v1, _rx, _) = host.add_viewer();
    host.remove_viewer(v1);

    for _ in 0..50 {
        if host.is_stopped() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("host did not stop after idle grace")
}

#[tokio::test]
async fn reattach_within_grace_cancels_stop() -> anyhow::Result<()> {
    let (host_io, agent_io) = tokio::io::duplex(64 * 1024);
    let _agent = spawn_fake_agent(agent_io);
    let (r, w) = tokio::io::split(host_io);
    let mut config = test_config(PermissionMode::Default);
    config.idle_grace = Duration::from_millis(300);
    let host = AcpHost::connect(r, w, config);
    host.handshake().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    let (v1, _rx, _) = host.add_viewer();
    host.remove_viewer(v1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (_v2, _rx2, _) = host.add_viewer();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!host.is_stopped());
    Ok(())
}
