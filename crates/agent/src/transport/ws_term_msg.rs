// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed envelope for the multiplexed terminal WebSocket. One JSON message
//! per frame; byte payloads are base64.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateSession {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        rows: Option<u16>,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default, rename = "workDir")]
        work_dir: Option<String>,
    },
    Input {
        id: String,
        /// Base64-encoded bytes.
        data: String,
    },
    Resize {
        id: String,
        rows: u16,
        cols: u16,
    },
    CloseSession {
        id: String,
    },
    OrphanSession {
        id: String,
    },
    ReattachSession {
        id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Output {
        id: String,
        /// Base64-encoded bytes.
        data: String,
    },
    Status {
        id: String,
        status: String,
        #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn status(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self::Status { id: id.into(), status: status.into(), exit_code: None, message: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }
}

/// Query parameters accepted on the terminal WS upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct TermQuery {
    pub token: Option<String>,
    /// Workspace id for multi-workspace nodes.
    pub workspace: Option<String>,
}
