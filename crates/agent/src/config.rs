// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// On-VM workspace agent: terminal and AI-agent session multiplexer.
#[derive(Debug, Clone, Parser)]
#[command(name = "vm-agent", version, about)]
pub struct AgentConfig {
    /// Host address to bind to.
    #[arg(long, env = "VM_AGENT_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP port to listen on.
    #[arg(long, env = "VM_AGENT_PORT", default_value_t = 8080)]
    pub port: u16,

    /// This node's identity, as asserted by node-management tokens.
    #[arg(long, env = "NODE_ID", default_value = "")]
    pub node_id: String,

    /// Workspace served by this VM (single-workspace deployments).
    #[arg(long, env = "WORKSPACE_ID", default_value = "")]
    pub workspace_id: String,

    /// Control plane base URL. Heartbeats are disabled when unset.
    #[arg(long, env = "CONTROL_PLANE_URL")]
    pub control_plane_url: Option<String>,

    /// Bearer token for control-plane callbacks. Blank before bootstrap.
    #[arg(long, env = "CALLBACK_TOKEN")]
    pub callback_token: Option<String>,

    /// JWKS URL for JWT validation. Auth is refused entirely when unset.
    #[arg(long, env = "JWKS_URL")]
    pub jwks_url: Option<String>,

    /// Expected JWT issuer.
    #[arg(long, env = "JWT_ISSUER", default_value = "")]
    pub jwt_issuer: String,

    /// Whether the deployment terminates TLS (controls the Secure cookie flag).
    #[arg(long, env = "VM_AGENT_HTTPS", default_value_t = false)]
    pub https: bool,

    // -- PTY defaults ---------------------------------------------------------

    /// Login shell for new terminal sessions.
    #[arg(long, env = "DEFAULT_SHELL", default_value = "/bin/bash")]
    pub default_shell: String,

    #[arg(long, env = "DEFAULT_ROWS", default_value_t = 24)]
    pub default_rows: u16,

    #[arg(long, env = "DEFAULT_COLS", default_value_t = 80)]
    pub default_cols: u16,

    /// Default working directory for sessions and agents.
    #[arg(long, env = "WORKSPACE_DIR", default_value = "/workspace")]
    pub workspace_dir: PathBuf,

    /// Scrollback bytes per session.
    #[arg(long, env = "PTY_RING_CAPACITY", default_value_t = 256 * 1024)]
    pub ring_capacity: usize,

    /// Per-user cap on live terminal sessions. 0 disables.
    #[arg(long, env = "MAX_SESSIONS_PER_USER", default_value_t = 0)]
    pub max_sessions_per_user: usize,

    /// Orphaned-session grace period. 0s disables auto-cleanup.
    #[arg(long, env = "ORPHAN_GRACE_PERIOD", default_value = "5m", value_parser = parse_go_duration)]
    pub orphan_grace: Duration,

    /// Devcontainer name to exec sessions into. Unset runs shells directly.
    #[arg(long, env = "DEVCONTAINER_NAME")]
    pub devcontainer_name: Option<String>,

    /// User for `docker exec` sessions.
    #[arg(long, env = "DEVCONTAINER_USER")]
    pub devcontainer_user: Option<String>,

    // -- Idle / heartbeat -----------------------------------------------------

    /// Idle threshold before local shutdown. 0s disables.
    #[arg(long, env = "IDLE_TIMEOUT", default_value = "30m", value_parser = parse_go_duration)]
    pub idle_timeout: Duration,

    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value = "30s", value_parser = parse_go_duration)]
    pub heartbeat_interval: Duration,

    #[arg(long, env = "IDLE_CHECK_INTERVAL", default_value = "15s", value_parser = parse_go_duration)]
    pub idle_check_interval: Duration,

    // -- Agent sessions -------------------------------------------------------

    /// Cap on concurrent agent sessions per workspace. 0 disables.
    #[arg(long, env = "MAX_AGENT_SESSIONS_PER_WORKSPACE", default_value_t = 10)]
    pub max_agent_sessions: usize,

    /// How long an agent host survives with no viewers and no active turn.
    #[arg(long, env = "AGENT_IDLE_GRACE", default_value = "5m", value_parser = parse_go_duration)]
    pub agent_idle_grace: Duration,

    // -- Worktrees ------------------------------------------------------------

    #[arg(long, env = "MAX_WORKTREES_PER_WORKSPACE", default_value_t = 10)]
    pub max_worktrees: usize,

    #[arg(long, env = "WORKTREE_CACHE_TTL_SECONDS", default_value_t = 30)]
    pub worktree_cache_ttl_seconds: u64,

    #[arg(long, env = "WORKTREE_EXEC_TIMEOUT", default_value = "30s", value_parser = parse_go_duration)]
    pub worktree_exec_timeout: Duration,

    // -- Sysinfo --------------------------------------------------------------

    #[arg(long, env = "SYSINFO_DOCKER_TIMEOUT", default_value = "5s", value_parser = parse_go_duration)]
    pub sysinfo_docker_timeout: Duration,

    #[arg(long, env = "SYSINFO_DOCKER_LIST_TIMEOUT", default_value = "5s", value_parser = parse_go_duration)]
    pub sysinfo_docker_list_timeout: Duration,

    #[arg(long, env = "SYSINFO_DOCKER_STATS_TIMEOUT", default_value = "10s", value_parser = parse_go_duration)]
    pub sysinfo_docker_stats_timeout: Duration,

    // -- HTTP sessions --------------------------------------------------------

    /// Cookie session lifetime.
    #[arg(long, env = "HTTP_SESSION_TTL", default_value = "12h", value_parser = parse_go_duration)]
    pub http_session_ttl: Duration,

    /// Cookie session store capacity (LRU).
    #[arg(long, env = "HTTP_SESSION_MAX", default_value_t = 1024)]
    pub http_session_max: usize,

    // -- Logging --------------------------------------------------------------

    /// Log format (json or text).
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,
}

impl AgentConfig {
    pub fn worktree_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.worktree_cache_ttl_seconds)
    }
}

/// Parse a Go-style duration: `300ms`, `30s`, `5m`, `12h`, `1h30m`.
pub fn parse_go_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_owned());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let mut unit = String::from(c);
        // Two-letter units: ms, us, ns.
        if matches!(c, 'm' | 'u' | 'n') && chars.peek() == Some(&'s') {
            unit.push('s');
            let _ = chars.next();
        }
        let value: f64 = number.parse().map_err(|_| format!("bad number in duration {s:?}"))?;
        number.clear();
        let unit_secs = match unit.as_str() {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("unknown unit {unit:?} in duration {s:?}")),
        };
        total += Duration::from_secs_f64(value * unit_secs);
    }
    if !number.is_empty() {
        return Err(format!("missing unit in duration {s:?}"));
    }
    Ok(total)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
