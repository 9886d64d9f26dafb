// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};

/// Supported coding-agent backends.
///
/// A new agent is a new table entry below; there is no plugin loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentKind {
    #[serde(rename = "claude-code")]
    ClaudeCode,
    #[serde(rename = "openai-codex")]
    OpenaiCodex,
    #[serde(rename = "google-gemini")]
    GoogleGemini,
}

impl AgentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude-code" => Some(Self::ClaudeCode),
            "openai-codex" => Some(Self::OpenaiCodex),
            "google-gemini" => Some(Self::GoogleGemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::OpenaiCodex => "openai-codex",
            Self::GoogleGemini => "google-gemini",
        }
    }

    /// Agent binary and fixed arguments.
    pub fn command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Self::ClaudeCode => ("claude-code-acp", &[]),
            Self::OpenaiCodex => ("codex-acp", &[]),
            Self::GoogleGemini => ("gemini", &["--experimental-acp"]),
        }
    }

    /// Environment variable the credential is injected through.
    pub fn credential_env(&self, kind: CredentialKind) -> &'static str {
        match (self, kind) {
            (Self::ClaudeCode, CredentialKind::OauthToken) => "CLAUDE_CODE_OAUTH_TOKEN",
            (Self::ClaudeCode, CredentialKind::ApiKey) => "ANTHROPIC_API_KEY",
            (Self::OpenaiCodex, _) => "OPENAI_API_KEY",
            (Self::GoogleGemini, _) => "GEMINI_API_KEY",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the control plane labelled the brokered credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    OauthToken,
    ApiKey,
}

/// A credential forwarded from the control plane for one agent session.
#[derive(Debug, Clone)]
pub struct Credential {
    pub kind: CredentialKind,
    pub value: String,
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
