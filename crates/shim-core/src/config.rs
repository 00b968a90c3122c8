use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Default cap on runtime threads. One shim runs per container or exec, so
/// on a dense host the per-process thread count matters more than raw I/O
/// parallelism.
pub const DEFAULT_MAX_THREADS: usize = 6;

/// Environment variable that overrides `max_threads`.
pub const MAX_THREADS_ENV: &str = "SHIM_MAX_THREADS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Settings for one shim process.
///
/// Values come from defaults, then an optional TOML file (`[shim]` table),
/// then command-line flags. Only the emptiness of the three identifiers is
/// checked here; everything else is trusted as already validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    /// Agent socket endpoint, `unix:///path` or a bare path.
    pub agent_address: String,
    pub container_id: String,
    pub exec_id: String,
    /// A pseudo-terminal is set up for the process.
    pub terminal: bool,
    /// Exit with the remote process' exit code instead of 0.
    pub proxy_exit_code: bool,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Append logs to this file. Logs are discarded when unset.
    pub log_file: Option<PathBuf>,
    pub debug: bool,
    /// Enable span recording.
    pub trace: bool,
    /// Optional deadline for the remote wait, in seconds.
    pub wait_timeout_secs: Option<u64>,
    pub max_threads: usize,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            agent_address: String::new(),
            container_id: String::new(),
            exec_id: String::new(),
            terminal: false,
            proxy_exit_code: true,
            log_level: "warn".to_string(),
            log_format: LogFormat::Text,
            log_file: None,
            debug: false,
            trace: false,
            wait_timeout_secs: None,
            max_threads: DEFAULT_MAX_THREADS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    shim: Option<ShimConfig>,
}

impl ShimConfig {
    pub fn new(
        agent_address: impl Into<String>,
        container_id: impl Into<String>,
        exec_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_address: agent_address.into(),
            container_id: container_id.into(),
            exec_id: exec_id.into(),
            ..Self::default()
        }
    }

    /// Load the `[shim]` table from a TOML file. A file without that table
    /// yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(file.shim.unwrap_or_default())
    }

    /// Pre-flight check run before any connection attempt.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.agent_address.trim().is_empty() {
            missing.push("agent socket endpoint");
        }
        if self.container_id.trim().is_empty() {
            missing.push("container ID");
        }
        if self.exec_id.trim().is_empty() {
            missing.push("exec ID");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{} must be set",
                missing.join(", ")
            )));
        }
        if self.max_threads == 0 {
            return Err(ConfigError::Validation(
                "max_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Debug mode is on when requested explicitly or implied by the level.
    pub fn is_debug(&self) -> bool {
        self.debug || self.log_level.eq_ignore_ascii_case("debug")
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }

    /// Thread cap after applying the `SHIM_MAX_THREADS` override.
    pub fn effective_max_threads(&self) -> usize {
        resolve_max_threads(
            std::env::var(MAX_THREADS_ENV).ok().as_deref(),
            self.max_threads,
        )
    }
}

/// An unparsable or zero override is ignored.
pub fn resolve_max_threads(env_value: Option<&str>, configured: usize) -> usize {
    env_value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(configured)
        .max(1)
}
