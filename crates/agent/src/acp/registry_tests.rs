// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn parse_round_trips() {
    for kind in [AgentKind::ClaudeCode, AgentKind::OpenaiCodex, AgentKind::GoogleGemini] {
        assert_eq!(AgentKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(AgentKind::parse("jetbrains-junie"), None);
}

#[test]
fn claude_credential_env_depends_on_kind() {
    let claude = AgentKind::ClaudeCode;
    assert_eq!(claude.credential_env(CredentialKind::OauthToken), "CLAUDE_CODE_OAUTH_TOKEN");
    assert_eq!(claude.credential_env(CredentialKind::ApiKey), "ANTHROPIC_API_KEY");
}

#[test]
fn gemini_runs_with_experimental_flag() {
    let (bin, args) = AgentKind::GoogleGemini.command();
    assert_eq!(bin, "gemini");
    assert_eq!(args, ["--experimental-acp"]);
}
