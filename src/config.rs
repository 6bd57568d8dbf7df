//! Agentbridge configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main Agentbridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Gateway (HTTP + WebSocket) configuration
    pub gateway: GatewayConfig,

    /// External agent process configuration
    pub agent: AgentConfig,

    /// Protocol channel tuning
    pub protocol: ProtocolConfig,

    /// Tool permission policy
    pub permissions: PermissionConfig,
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Outbound queue depth per transport connection. Events for a
    /// transport whose queue is full are dropped.
    pub transport_buffer: usize,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18791,
            transport_buffer: 256,
            cors_origins: Vec::new(),
        }
    }
}

/// External agent process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable (name on PATH or path)
    pub command: String,

    /// Arguments passed to the agent
    pub args: Vec<String>,

    /// Environment overrides. A value of the form `${NAME}` is read from the
    /// host environment at spawn time.
    pub env: HashMap<String, String>,

    /// Working directory of the agent process
    pub working_dir: Option<PathBuf>,

    /// Seconds to wait for a natural exit after closing the agent's input
    pub shutdown_grace_secs: u64,

    /// Relaunch the agent when it exits unexpectedly
    pub restart_on_exit: bool,

    /// Delay before a relaunch
    pub restart_backoff_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude-code-acp".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            shutdown_grace_secs: 5,
            restart_on_exit: true,
            restart_backoff_secs: 2,
        }
    }
}

impl AgentConfig {
    /// Resolve `env` against the host environment.
    ///
    /// Literal values pass through unchanged. `${NAME}` references that are not
    /// set on the host are skipped with a warning rather than injected empty.
    pub fn resolve_env(&self) -> HashMap<String, String> {
        let mut resolved = HashMap::new();
        for (key, value) in &self.env {
            match value
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
            {
                Some(name) => match std::env::var(name) {
                    Ok(v) => {
                        resolved.insert(key.clone(), v);
                    }
                    Err(_) => {
                        tracing::warn!(
                            key = %key,
                            source = %name,
                            "Host environment variable not set, skipping agent env override"
                        );
                    }
                },
                None => {
                    resolved.insert(key.clone(), value.clone());
                }
            }
        }
        resolved
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Delay before relaunching an exited agent, never less than a second
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs.max(1))
    }
}

/// Protocol channel tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Bounded queue depth for inbound notifications
    pub notification_capacity: usize,

    /// Bounded queue depth for inbound calls (permission requests etc.)
    pub incoming_capacity: usize,

    /// Default deadline for request/response calls (0 = no deadline)
    pub call_timeout_secs: u64,

    /// Deadline for a whole prompt turn (0 = no deadline)
    pub prompt_timeout_secs: u64,

    /// Lines longer than this are discarded
    pub max_line_bytes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            notification_capacity: 1024,
            incoming_capacity: 64,
            call_timeout_secs: 60,
            prompt_timeout_secs: 1800,
            max_line_bytes: 8 * 1024 * 1024,
        }
    }
}

impl ProtocolConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.call_timeout_secs)
    }

    pub fn prompt_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.prompt_timeout_secs)
    }
}

/// Tool permission policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Evaluate the read-only heuristic; when false every request is deferred
    pub auto_approve: bool,

    /// Shell commands approved without review (exact or followed by arguments)
    pub safe_commands: Vec<String>,

    /// Seconds a deferred request waits for a reviewer before it is rejected
    pub review_timeout_secs: u64,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            auto_approve: true,
            safe_commands: default_safe_commands(),
            review_timeout_secs: 300,
        }
    }
}

impl PermissionConfig {
    pub fn review_timeout(&self) -> Duration {
        Duration::from_secs(self.review_timeout_secs)
    }
}

/// Commands considered read-only
pub fn default_safe_commands() -> Vec<String> {
    ["ls", "cat", "grep", "git status", "pwd", "whoami", "echo", "date"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, else the per-user config file, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => {
                tracing::info!(path = %path.display(), "Loading configuration");
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Reject values that would make the bridge unusable
    pub fn validate(&self) -> Result<()> {
        if self.agent.command.trim().is_empty() {
            return Err(Error::Config("agent.command must not be empty".to_string()));
        }
        if self.protocol.notification_capacity == 0 || self.protocol.incoming_capacity == 0 {
            return Err(Error::Config(
                "protocol queue capacities must be greater than zero".to_string(),
            ));
        }
        if self.agent.restart_on_exit && self.agent.restart_backoff_secs == 0 {
            return Err(Error::Config(
                "agent.restart_backoff_secs must be at least 1 when restart_on_exit is set"
                    .to_string(),
            ));
        }
        if self.gateway.transport_buffer == 0 {
            return Err(Error::Config(
                "gateway.transport_buffer must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// `<config_dir>/agentbridge/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|d| d.join("agentbridge").join("config.toml"))
}
