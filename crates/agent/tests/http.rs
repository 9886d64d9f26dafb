// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the REST API.
//!
//! Uses `axum_test::TestServer` — no real TCP needed except for the JWKS
//! stub the validator fetches keys from.

use axum_test::TestServer;

use vm_agent::test_support::{
    authed_state, base_config, mint_token, workspace_token, TokenSpec, TEST_NODE, TEST_WORKSPACE,
};
use vm_agent::transport::build_router;

async fn test_server() -> anyhow::Result<TestServer> {
    let tmp = tempfile::tempdir()?;
    let state = authed_state(base_config(tmp.path().to_path_buf())).await?;
    TestServer::new(build_router(state)).map_err(|e| anyhow::anyhow!("{e}"))
}

#[tokio::test]
async fn health_is_public() -> anyhow::Result<()> {
    let server = test_server().await?;
    let resp = server.get("/health").await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "running");
    assert_eq!(body["sessions"], 0);
    Ok(())
}

#[tokio::test]
async fn api_requires_auth() -> anyhow::Result<()> {
    let server = test_server().await?;
    let resp = server.get("/api/sessions").await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);

    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"], "UNAUTHORIZED");
    Ok(())
}

#[tokio::test]
async fn bearer_token_grants_access() -> anyhow::Result<()> {
    let server = test_server().await?;
    let token = workspace_token()?;

    let resp = server
        .get("/api/sessions")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    resp.assert_status_ok();

    let list: Vec<serde_json::Value> = resp.json();
    assert!(list.is_empty());
    Ok(())
}

#[tokio::test]
async fn workspace_claim_mismatch_is_rejected() -> anyhow::Result<()> {
    let server = test_server().await?;
    let token = mint_token(&TokenSpec {
        workspace: Some("ws-zzzzzz"),
        ..TokenSpec::default()
    })?;

    let resp = server
        .get("/api/sessions")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn login_issues_cookie_that_authenticates() -> anyhow::Result<()> {
    let server = test_server().await?;
    let token = workspace_token()?;

    let login = server
        .post("/api/auth/login")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    login.assert_status_ok();

    let set_cookie = login
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| anyhow::anyhow!("no set-cookie header"))?;
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Strict"));
    assert!(set_cookie.contains("Path=/"));

    let cookie_pair = set_cookie
        .split(';')
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty cookie"))?
        .to_owned();
    let resp = server.get("/api/sessions").add_header("cookie", cookie_pair).await;
    resp.assert_status_ok();
    Ok(())
}

#[tokio::test]
async fn logout_invalidates_cookie() -> anyhow::Result<()> {
    let server = test_server().await?;
    let token = workspace_token()?;

    let login = server
        .post("/api/auth/login")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    let set_cookie = login
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| anyhow::anyhow!("no set-cookie header"))?;
    let cookie_pair = set_cookie
        .split(';')
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty cookie"))?
        .to_owned();

    server
        .post("/api/auth/logout")
        .add_header("cookie", cookie_pair.clone())
        .await
        .assert_status_ok();

    let resp = server.get("/api/sessions").add_header("cookie", cookie_pair).await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn node_routes_require_node_audience() -> anyhow::Result<()> {
    let server = test_server().await?;

    // A workspace token is not enough for node management.
    let ws_token = workspace_token()?;
    let resp = server
        .get("/api/node/info")
        .add_header("authorization", format!("Bearer {ws_token}"))
        .await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);

    // A node token with the right node claim is.
    let node_token = mint_token(&TokenSpec {
        audiences: vec!["node-management"],
        node: Some(TEST_NODE),
        ..TokenSpec::default()
    })?;
    let resp = server
        .get("/api/node/info")
        .add_header("authorization", format!("Bearer {node_token}"))
        .await;
    resp.assert_status_ok();
    Ok(())
}

#[tokio::test]
async fn quick_metrics_round_trip() -> anyhow::Result<()> {
    let server = test_server().await?;
    let token = workspace_token()?;

    let resp = server
        .get("/api/quick-metrics")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    resp.assert_status_ok();

    let body: serde_json::Value = resp.json();
    assert!(body["memPercent"].is_number());
    assert!(body["diskPercent"].is_number());
    Ok(())
}

#[tokio::test]
async fn activity_endpoint_records() -> anyhow::Result<()> {
    let server = test_server().await?;
    let token = workspace_token()?;

    let resp = server
        .post("/api/activity")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["recorded"], true);
    Ok(())
}

#[tokio::test]
async fn closing_unknown_session_is_404() -> anyhow::Result<()> {
    let server = test_server().await?;
    let token = workspace_token()?;

    let resp = server
        .delete("/api/sessions/no-such-session")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    resp.assert_status(axum::http::StatusCode::NOT_FOUND);

    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"], "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn bootstrap_without_control_plane_is_upstream_error() -> anyhow::Result<()> {
    let server = test_server().await?;
    let resp = server
        .post("/api/bootstrap")
        .json(&serde_json::json!({ "token": "bt-123" }))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_GATEWAY);
    Ok(())
}

#[tokio::test]
async fn agent_sessions_list_is_empty_initially() -> anyhow::Result<()> {
    let server = test_server().await?;
    let token = workspace_token()?;

    let resp = server
        .get("/api/agent-sessions")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    resp.assert_status_ok();
    let list: Vec<serde_json::Value> = resp.json();
    assert!(list.is_empty());
    Ok(())
}

#[tokio::test]
async fn multi_workspace_nodes_take_workspace_from_url() -> anyhow::Result<()> {
    // A node with no pinned workspace id validates against the URL hint.
    let tmp = tempfile::tempdir()?;
    let mut config = base_config(tmp.path().to_path_buf());
    config.workspace_id = String::new();
    let state = authed_state(config).await?;
    let server = TestServer::new(build_router(state)).map_err(|e| anyhow::anyhow!("{e}"))?;

    let token = mint_token(&TokenSpec {
        workspace: Some(TEST_WORKSPACE),
        ..TokenSpec::default()
    })?;

    let resp = server
        .get(&format!("/api/sessions?workspace={TEST_WORKSPACE}"))
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    resp.assert_status_ok();

    let resp = server
        .get("/api/sessions?workspace=ws-other1")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);

    // A malformed workspace id in the URL can never match a claim.
    let resp = server
        .get("/api/sessions?workspace=WS-ABC123")
        .add_header("authorization", format!("Bearer {token}"))
        .await;
    resp.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    Ok(())
}
