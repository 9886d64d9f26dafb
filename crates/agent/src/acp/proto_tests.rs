// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn request_serializes_jsonrpc_envelope() -> anyhow::Result<()> {
    let req = Request::new(
        3,
        "newSession",
        Some(serde_json::to_value(NewSessionParams {
            cwd: "/workspace".to_owned(),
            permission_mode: PermissionMode::AcceptEdits,
            env: None,
        })?),
    );
    let v: Value = serde_json::to_value(&req)?;
    assert_eq!(v["jsonrpc"], "2.0");
    assert_eq!(v["id"], 3);
    assert_eq!(v["method"], "newSession");
    assert_eq!(v["params"]["cwd"], "/workspace");
    assert_eq!(v["params"]["permissionMode"], "acceptEdits");
    Ok(())
}

#[test]
fn incoming_frame_classification() -> anyhow::Result<()> {
    let notification: Incoming =
        serde_json::from_str(r#"{"jsonrpc":"2.0","method":"session/update","params":{}}"#)?;
    assert!(notification.is_notification());
    assert!(!notification.is_request());

    let request: Incoming = serde_json::from_str(
        r#"{"jsonrpc":"2.0","id":7,"method":"session/request_permission","params":{}}"#,
    )?;
    assert!(request.is_request());

    let reply: Incoming =
        serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"sessionId":"s-1"}}"#)?;
    assert!(reply.is_reply());
    let result: SessionResult = serde_json::from_value(reply.result.unwrap_or_default())?;
    assert_eq!(result.session_id, "s-1");
    Ok(())
}

#[test]
fn permission_mode_wire_names() {
    for (s, mode) in [
        ("default", PermissionMode::Default),
        ("acceptEdits", PermissionMode::AcceptEdits),
        ("plan", PermissionMode::Plan),
        ("dontAsk", PermissionMode::DontAsk),
        ("bypassPermissions", PermissionMode::BypassPermissions),
    ] {
        assert_eq!(PermissionMode::parse(s), Some(mode));
        assert_eq!(serde_json::to_value(mode).ok(), Some(Value::String(s.to_owned())));
    }
    assert_eq!(PermissionMode::parse("yolo"), None);
}

#[test]
fn error_reply_round_trip() -> anyhow::Result<()> {
    let resp = Response::err(Value::from(9), -32601, "method not found");
    let v = serde_json::to_value(&resp)?;
    assert_eq!(v["error"]["code"], -32601);
    assert!(v.get("result").is_none());
    Ok(())
}
