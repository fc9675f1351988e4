//! Environment-driven configuration shared by the agent and
//! orchestrator binaries (spec §4.6, §6.3). Read once at process
//! start; there is no hot-reload or persistence, matching the
//! non-goal of no state surviving a restart.

use std::path::PathBuf;

use crate::cgroup::DEFAULT_CGROUP_ROOT;

pub const DEFAULT_SOCKET_PATH: &str = "/run/holden-agent.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// Hand the pidfd to the caller and track nothing.
    Handoff,
    /// Keep the child in the registry for Stop/List/ApplyConstraints.
    Tracked,
}

impl AgentMode {
    /// Parse a `handoff`/`tracked` value from either the environment or
    /// a CLI override — both sources share the same vocabulary.
    pub fn from_env_value(value: &str) -> anyhow::Result<Self> {
        match value {
            "handoff" => Ok(AgentMode::Handoff),
            "tracked" => Ok(AgentMode::Tracked),
            other => anyhow::bail!("HOLDEN_AGENT_MODE must be 'handoff' or 'tracked', got {other:?}"),
        }
    }
}

pub fn socket_path() -> PathBuf {
    std::env::var_os("HOLDEN_SOCKET_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

pub fn cgroup_root() -> PathBuf {
    std::env::var_os("HOLDEN_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CGROUP_ROOT))
}

/// Defaults to `Handoff`: it's what `spawn_via_agent` (the orchestrator
/// binary's agent-forked peer, §4.5) expects without an explicit
/// `--mode`/`HOLDEN_AGENT_MODE` override — it issues `recv_fd`
/// unconditionally right after `ProcessStarted`, which a tracked-mode
/// agent never satisfies. Stop/List/ApplyConstraints need `tracked`
/// explicitly (§9 Open Questions).
pub fn agent_mode() -> anyhow::Result<AgentMode> {
    match std::env::var("HOLDEN_AGENT_MODE") {
        Ok(v) => AgentMode::from_env_value(&v),
        Err(std::env::VarError::NotPresent) => Ok(AgentMode::Handoff),
        Err(e) => anyhow::bail!("HOLDEN_AGENT_MODE: {e}"),
    }
}

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
