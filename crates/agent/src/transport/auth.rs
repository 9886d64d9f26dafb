// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request authentication: session cookie or bearer JWT, with per-route
//! audience rules.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::auth::jwt::Audience;
use crate::auth::{Claims, SESSION_COOKIE};
use crate::error::{AgentError, ErrorCode};
use crate::state::AppState;

/// Routes that skip authentication entirely: liveness, WS upgrades (which
/// authenticate in their handlers), and provisioning-time endpoints that
/// carry their own token.
fn is_public(path: &str) -> bool {
    path == "/health" || path.starts_with("/ws/") || path == "/api/bootstrap" || path == "/api/boot-log"
}

/// Authenticated caller, stored as a request extension.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: Claims,
}

impl AuthContext {
    pub fn user_id(&self) -> &str {
        &self.claims.sub
    }
}

/// Axum middleware enforcing cookie-or-JWT auth on all REST routes.
pub async fn auth_layer(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if is_public(&path) {
        return next.run(req).await;
    }

    let workspace_hint = query_param(req.uri().query(), "workspace");
    let audience = if path.starts_with("/api/node/") {
        Audience::Node { node_id: &state.config.node_id }
    } else {
        Audience::Workspace {
            workspace_id: state.expected_workspace(workspace_hint.as_deref()),
        }
    };

    match authenticate(&state, req.headers(), audience).await {
        Ok(claims) => {
            req.extensions_mut().insert(AuthContext { claims });
            next.run(req).await
        }
        Err(e) => e.to_http_response().into_response(),
    }
}

/// Resolve the caller from a session cookie or a bearer token.
pub async fn authenticate(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    audience: Audience<'_>,
) -> Result<Claims, AgentError> {
    if let Some(cookie_id) = cookie_value(headers, SESSION_COOKIE) {
        if let Some(claims) = state.http_sessions.get(&cookie_id).await {
            return Ok(claims);
        }
    }

    let token = bearer_token(headers)
        .ok_or_else(|| AgentError::new(ErrorCode::Unauthorized, "authentication required"))?;
    validate_token(state, &token, audience).await
}

/// Validate a raw JWT (bearer header or WS query parameter).
pub async fn validate_token(
    state: &AppState,
    token: &str,
    audience: Audience<'_>,
) -> Result<Claims, AgentError> {
    let jwt = state
        .jwt
        .as_ref()
        .ok_or_else(|| AgentError::new(ErrorCode::Unauthorized, "authentication not configured"))?;
    jwt.validate(token, audience).await
}

pub fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

pub fn cookie_value(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let (k, v) = pair.trim().split_once('=')?;
        if k == name {
            return Some(v.to_owned());
        }
    }
    None
}

/// Pull one key out of a raw query string.
pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    for pair in query?.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == name {
                return Some(v.to_owned());
            }
        }
    }
    None
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
