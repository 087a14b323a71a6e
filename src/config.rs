//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::{AppError, Result};

/// External conversational engine invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Engine binary (e.g., `/app/venv/bin/rasa`).
    #[serde(default = "default_engine_binary")]
    pub binary: String,
    /// Arguments for serving; `{port}` is replaced with the reserved port.
    #[serde(default = "default_run_args")]
    pub run_args: Vec<String>,
    /// Arguments for the optional training phase.
    #[serde(default = "default_train_args")]
    pub train_args: Vec<String>,
    /// Run the training phase before every launch.
    #[serde(default)]
    pub train_before_launch: bool,
    /// Regular expression matched against each output line to detect readiness.
    #[serde(default = "default_ready_pattern")]
    pub ready_pattern: String,
    /// Maximum duration of the training phase.
    #[serde(default = "default_train_timeout")]
    pub train_timeout_seconds: u64,
    /// Maximum wait for the readiness marker once the server process starts.
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_seconds: u64,
    /// Grace period between the termination signal and a forced kill.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
    /// Longest output line scanned; longer lines are truncated.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Host placed in the endpoint handed to participants.
    #[serde(default = "default_endpoint_host")]
    pub endpoint_host: String,
}

fn default_engine_binary() -> String {
    "rasa".into()
}

fn default_run_args() -> Vec<String> {
    ["run", "--enable-api", "--cors", "*", "--port", "{port}"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_train_args() -> Vec<String> {
    vec!["train".into()]
}

fn default_ready_pattern() -> String {
    "Rasa server is up and running".into()
}

fn default_train_timeout() -> u64 {
    1800
}

fn default_endpoint_host() -> String {
    "127.0.0.1".into()
}

fn default_readiness_timeout() -> u64 {
    300
}

fn default_stop_grace() -> u64 {
    5
}

fn default_max_line_bytes() -> usize {
    64 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            run_args: default_run_args(),
            train_args: default_train_args(),
            train_before_launch: false,
            ready_pattern: default_ready_pattern(),
            train_timeout_seconds: default_train_timeout(),
            readiness_timeout_seconds: default_readiness_timeout(),
            stop_grace_seconds: default_stop_grace(),
            max_line_bytes: default_max_line_bytes(),
            endpoint_host: default_endpoint_host(),
        }
    }
}

impl EngineConfig {
    /// Readiness timeout as a [`Duration`].
    #[must_use]
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_seconds)
    }

    /// Training timeout as a [`Duration`].
    #[must_use]
    pub fn train_timeout(&self) -> Duration {
        Duration::from_secs(self.train_timeout_seconds)
    }

    /// Stop grace period as a [`Duration`].
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }

    /// Serving arguments with `{port}` substituted.
    #[must_use]
    pub fn run_args_for_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.run_args
            .iter()
            .map(|arg| arg.replace("{port}", &port))
            .collect()
    }

    /// Endpoint URL for a worker listening on `port`.
    #[must_use]
    pub fn endpoint_for_port(&self, port: u16) -> String {
        format!("http://{}:{port}", self.endpoint_host)
    }

    /// Compile the readiness pattern.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the pattern is not a valid regex.
    pub fn ready_regex(&self) -> Result<Regex> {
        Regex::new(&self.ready_pattern)
            .map_err(|err| AppError::Config(format!("invalid ready_pattern: {err}")))
    }
}

/// Port range handed out to workers, one port per live session.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PortRangeConfig {
    /// First port of the range.
    #[serde(default = "default_port_base")]
    pub base: u16,
    /// Number of ports in the range.
    #[serde(default = "default_port_count")]
    pub count: u16,
}

fn default_port_base() -> u16 {
    5005
}

fn default_port_count() -> u16 {
    64
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            base: default_port_base(),
            count: default_port_count(),
        }
    }
}

/// Orphaned workspace reclamation.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SweepConfig {
    /// Whether the background sweep runs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval")]
    pub interval_seconds: u64,
    /// Workspaces older than this with no live session are removed.
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_max_age_hours() -> u64 {
    24
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_sweep_interval(),
            max_age_hours: default_max_age_hours(),
        }
    }
}

fn default_http_port() -> u16 {
    3000
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory under which every session workspace is created.
    pub workspace_root: PathBuf,
    /// Directory whose files are copied into every workspace root.
    pub shared_files_dir: Option<PathBuf>,
    /// `SQLite` database file.
    pub database_path: PathBuf,
    /// HTTP port for the request surface.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Engine invocation settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Worker port range.
    #[serde(default)]
    pub ports: PortRangeConfig,
    /// Orphaned workspace sweep.
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Sweep age threshold as a [`Duration`].
    #[must_use]
    pub fn orphan_max_age(&self) -> Duration {
        Duration::from_secs(self.sweep.max_age_hours.saturating_mul(3600))
    }

    fn validate(&mut self) -> Result<()> {
        if self.engine.binary.trim().is_empty() {
            return Err(AppError::Config("engine.binary must not be empty".into()));
        }

        if self.engine.readiness_timeout_seconds == 0 {
            return Err(AppError::Config(
                "engine.readiness_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.engine.max_line_bytes == 0 {
            return Err(AppError::Config(
                "engine.max_line_bytes must be greater than zero".into(),
            ));
        }

        if self.ports.count == 0 {
            return Err(AppError::Config(
                "ports.count must be greater than zero".into(),
            ));
        }

        if self.ports.base.checked_add(self.ports.count - 1).is_none() {
            return Err(AppError::Config("ports range exceeds 65535".into()));
        }

        self.engine.ready_regex()?;

        fs::create_dir_all(&self.workspace_root)
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;

        if let Some(ref dir) = self.shared_files_dir {
            if !dir.is_dir() {
                return Err(AppError::Config(format!(
                    "shared_files_dir {} is not a directory",
                    dir.display()
                )));
            }
        }

        Ok(())
    }
}
