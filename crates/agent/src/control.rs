// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for the control plane: heartbeats, boot-log relay, and
//! bootstrap redemption. Every call is bounded by a per-request timeout
//! and failures are the caller's to tolerate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Heartbeat request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBody {
    pub idle_seconds: u64,
    pub idle: bool,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_activity: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load1: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_percent: Option<f64>,
}

/// Heartbeat response from the control plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub action: String,
    #[serde(default)]
    pub idle_seconds: Option<u64>,
    #[serde(default)]
    pub max_idle_seconds: Option<u64>,
    #[serde(default)]
    pub shutdown_deadline: Option<String>,
}

impl HeartbeatResponse {
    pub fn wants_shutdown(&self) -> bool {
        self.action == "shutdown"
    }
}

/// One structured boot-log entry relayed during provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootLogEntry {
    pub step: String,
    /// `started`, `completed`, or `failed`.
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Credentials returned when a bootstrap token is redeemed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapCredentials {
    pub callback_token: String,
}

pub struct ControlPlaneClient {
    base_url: String,
    workspace_id: String,
    /// Blank until bootstrap redemption installs it.
    callback_token: RwLock<Option<String>>,
    http: reqwest::Client,
}

impl ControlPlaneClient {
    pub fn new(
        base_url: impl Into<String>,
        workspace_id: impl Into<String>,
        callback_token: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            workspace_id: workspace_id.into(),
            callback_token: RwLock::new(callback_token.filter(|t| !t.is_empty())),
            http: reqwest::Client::new(),
        }
    }

    pub fn has_token(&self) -> bool {
        self.callback_token.read().is_some()
    }

    pub fn install_token(&self, token: impl Into<String>) {
        *self.callback_token.write() = Some(token.into());
    }

    fn bearer(&self) -> Option<String> {
        self.callback_token.read().clone()
    }

    /// `POST /api/workspaces/{id}/heartbeat`
    pub async fn heartbeat(&self, body: &HeartbeatBody) -> anyhow::Result<HeartbeatResponse> {
        let url = format!("{}/api/workspaces/{}/heartbeat", self.base_url, self.workspace_id);
        let mut req = self.http.post(&url).timeout(Duration::from_secs(10)).json(body);
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    /// `POST /api/workspaces/{id}/boot-log`
    pub async fn boot_log(&self, entry: &BootLogEntry) -> anyhow::Result<()> {
        let url = format!("{}/api/workspaces/{}/boot-log", self.base_url, self.workspace_id);
        let mut req = self.http.post(&url).timeout(Duration::from_secs(10)).json(entry);
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        req.send().await?.error_for_status()?;
        Ok(())
    }

    /// Redeem a one-shot bootstrap token for runtime credentials and
    /// install the resulting callback token.
    pub async fn redeem_bootstrap(&self, token: &str) -> anyhow::Result<BootstrapCredentials> {
        let url = format!("{}/api/workspaces/{}/bootstrap", self.base_url, self.workspace_id);
        let resp = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(10))
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?
            .error_for_status()?;
        let creds: BootstrapCredentials = resp.json().await?;
        self.install_token(creds.callback_token.clone());
        Ok(creds)
    }

    /// Workspace runtime env vars provisioned by the control plane.
    pub async fn workspace_env(&self) -> anyhow::Result<serde_json::Value> {
        self.get_json("env").await
    }

    /// A provisioned workspace file's contents.
    pub async fn workspace_file(&self, name: &str) -> anyhow::Result<serde_json::Value> {
        self.get_json(&format!("files/{name}")).await
    }

    async fn get_json(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}/api/workspaces/{}/{path}", self.base_url, self.workspace_id);
        let mut req = self.http.get(&url).timeout(Duration::from_secs(10));
        if let Some(token) = self.bearer() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }
}
