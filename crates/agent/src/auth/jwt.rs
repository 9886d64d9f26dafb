// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JWT validation against a remote JWKS.
//!
//! Keys are fetched once at startup (a failure there aborts the process),
//! cached by `kid`, and refreshed in the background. Validation checks the
//! signature, issuer, audience, and the workspace/node claim rules; the
//! caller only ever sees a generic unauthorized error so that probing
//! cannot reveal which check failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AgentError, ErrorCode};

/// Audience accepted for terminal and agent access.
pub const AUD_VM_AGENT: &str = "vm-agent";
/// Legacy audience still accepted for terminal access.
pub const AUD_WORKSPACE_TERMINAL: &str = "workspace-terminal";
/// Audience required for node-management endpoints.
pub const AUD_NODE_MANAGEMENT: &str = "node-management";

/// Timeout for JWKS fetches.
const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Shape of workspace ids as they appear in claims and URLs.
pub fn is_workspace_id(id: &str) -> bool {
    static RE: std::sync::OnceLock<Option<regex::Regex>> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new("^ws-[a-z0-9]{6}$").ok());
    re.as_ref().is_some_and(|re| re.is_match(id))
}

/// Decoded JWT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default, rename = "type")]
    pub token_type: Option<String>,
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    pub exp: u64,
}

/// Which audience rule a request must satisfy.
#[derive(Debug, Clone, Copy)]
pub enum Audience<'a> {
    /// Terminal/agent access: `vm-agent` (or the legacy audience) plus a
    /// matching `workspace` claim.
    Workspace { workspace_id: &'a str },
    /// Node management: `node-management` plus a matching `node` claim.
    Node { node_id: &'a str },
}

pub struct JwtValidator {
    jwks_url: String,
    issuer: String,
    http: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
}

impl JwtValidator {
    pub fn new(jwks_url: impl Into<String>, issuer: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            jwks_url: jwks_url.into(),
            issuer: issuer.into(),
            http: reqwest::Client::new(),
            keys: RwLock::new(HashMap::new()),
        })
    }

    /// Fetch the JWKS and replace the key cache.
    pub async fn refresh(&self) -> anyhow::Result<usize> {
        let resp = self
            .http
            .get(&self.jwks_url)
            .timeout(JWKS_FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let set: JwkSet = resp.json().await?;

        let mut keys = HashMap::new();
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(e) => warn!(kid = %kid, err = %e, "skipping unusable jwk"),
            }
        }
        let count = keys.len();
        *self.keys.write().await = keys;
        Ok(count)
    }

    /// Periodically re-fetch the JWKS until shutdown.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let validator = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if let Err(e) = validator.refresh().await {
                    warn!(err = %e, "jwks refresh failed");
                }
            }
        });
    }

    /// Validate a token under the given audience rule.
    pub async fn validate(&self, token: &str, audience: Audience<'_>) -> Result<Claims, AgentError> {
        self.validate_inner(token, audience).await.map_err(|detail| {
            debug!("jwt rejected: {detail}");
            AgentError::new(ErrorCode::Unauthorized, "invalid token")
        })
    }

    async fn validate_inner(&self, token: &str, audience: Audience<'_>) -> Result<Claims, String> {
        let header = decode_header(token).map_err(|e| format!("bad header: {e}"))?;
        if !matches!(header.alg, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) {
            return Err(format!("disallowed algorithm {:?}", header.alg));
        }
        let kid = header.kid.ok_or_else(|| "missing kid".to_owned())?;

        let key = match self.key_for(&kid).await {
            Some(key) => key,
            None => {
                // Unknown kid: the control plane may have rotated keys.
                if let Err(e) = self.refresh().await {
                    return Err(format!("jwks refresh failed: {e}"));
                }
                self.key_for(&kid).await.ok_or_else(|| format!("unknown kid {kid}"))?
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[self.issuer.as_str()]);
        match audience {
            Audience::Workspace { .. } => {
                validation.set_audience(&[AUD_VM_AGENT, AUD_WORKSPACE_TERMINAL]);
            }
            Audience::Node { .. } => {
                validation.set_audience(&[AUD_NODE_MANAGEMENT]);
            }
        }

        let data = decode::<Claims>(token, &key, &validation)
            .map_err(|e| format!("decode failed: {e}"))?;
        let claims = data.claims;

        match audience {
            Audience::Workspace { workspace_id } => {
                if claims.workspace.as_deref() != Some(workspace_id) {
                    return Err("workspace claim mismatch".to_owned());
                }
            }
            Audience::Node { node_id } => {
                if claims.node.as_deref() != Some(node_id) {
                    return Err("node claim mismatch".to_owned());
                }
            }
        }
        Ok(claims)
    }

    async fn key_for(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.read().await.get(kid).cloned()
    }
}

#[cfg(test)]
#[path = "jwt_tests.rs"]
mod tests;
