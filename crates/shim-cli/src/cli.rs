use std::path::PathBuf;

use clap::Parser;
use shim_core::error::ConfigError;
use shim_core::{LogFormat, ShimConfig};

/// sandbox-shim -- relay one container process between the host runtime and
/// the sandbox agent.
#[derive(Debug, Parser)]
#[command(name = "sandbox-shim", disable_version_flag = true)]
pub struct Cli {
    /// Agent socket endpoint (`unix:///path` or a path).
    #[arg(long = "agent", value_name = "ADDRESS")]
    pub agent: Option<String>,

    /// Container ID for the shim.
    #[arg(long)]
    pub container: Option<String>,

    /// Process ID for the shim.
    #[arg(long = "exec-id")]
    pub exec_id: Option<String>,

    /// A terminal is set up for the process.
    #[arg(long)]
    pub terminal: bool,

    /// Exit with the remote process' exit code [default: true].
    #[arg(
        long = "proxy-exit-code",
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub proxy_exit_code: Option<bool>,

    /// Log level: trace, debug, info, warn or error [default: warn].
    #[arg(long = "log", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Log record format: text or json.
    #[arg(long, value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    /// Append logs to this file instead of discarding them.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable debug mode.
    #[arg(long)]
    pub debug: bool,

    /// Record trace spans for each session phase.
    #[arg(long)]
    pub trace: bool,

    /// Give up waiting for the remote process after this many seconds.
    #[arg(long = "wait-timeout", value_name = "SECS")]
    pub wait_timeout: Option<u64>,

    /// Cap on runtime threads (SHIM_MAX_THREADS overrides).
    #[arg(long)]
    pub max_threads: Option<usize>,

    /// TOML file with a `[shim]` table.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Display program version and exit.
    #[arg(long)]
    pub version: bool,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    match value.to_ascii_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format {other:?} (expected text or json)")),
    }
}

impl Cli {
    /// Defaults, then the `--config` file, then flags.
    pub fn into_config(self) -> Result<ShimConfig, ConfigError> {
        let mut cfg = match &self.config {
            Some(path) => ShimConfig::load_from(path)?,
            None => ShimConfig::default(),
        };

        if let Some(agent) = self.agent {
            cfg.agent_address = agent;
        }
        if let Some(container) = self.container {
            cfg.container_id = container;
        }
        if let Some(exec_id) = self.exec_id {
            cfg.exec_id = exec_id;
        }
        if let Some(proxy) = self.proxy_exit_code {
            cfg.proxy_exit_code = proxy;
        }
        if let Some(level) = self.log_level {
            cfg.log_level = level;
        }
        if let Some(format) = self.log_format {
            cfg.log_format = format;
        }
        if let Some(file) = self.log_file {
            cfg.log_file = Some(file);
        }
        if let Some(secs) = self.wait_timeout {
            cfg.wait_timeout_secs = Some(secs);
        }
        if let Some(threads) = self.max_threads {
            cfg.max_threads = threads;
        }
        cfg.terminal |= self.terminal;
        cfg.debug |= self.debug;
        cfg.trace |= self.trace;
        Ok(cfg)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
