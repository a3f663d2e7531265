//! Configuration parsing for the training harness.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub harness: HarnessSettings,
    #[serde(default)]
    pub toolkit: ToolkitSettings,
    /// Extra environment passed to every child process.
    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub webui: WebUiSettings,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            harness: HarnessSettings::default(),
            toolkit: ToolkitSettings::default(),
            env: default_env(),
            webui: WebUiSettings::default(),
        }
    }
}

/// Harness-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    /// Where the output volume is mounted. Every job's training folder points here.
    #[serde(default = "default_mount_dir")]
    pub mount_dir: PathBuf,
    /// Directory used to resolve bare config names.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            mount_dir: default_mount_dir(),
            config_dir: default_config_dir(),
        }
    }
}

/// How to invoke the training toolkit for a single job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolkitSettings {
    /// Working directory of the toolkit checkout.
    #[serde(default = "default_toolkit_dir")]
    pub dir: PathBuf,
    /// Program to launch.
    #[serde(default = "default_toolkit_program")]
    pub program: String,
    /// Arguments placed before the resolved config file path.
    #[serde(default = "default_toolkit_args")]
    pub args: Vec<String>,
}

impl Default for ToolkitSettings {
    fn default() -> Self {
        Self {
            dir: default_toolkit_dir(),
            program: default_toolkit_program(),
            args: default_toolkit_args(),
        }
    }
}

/// Web UI server supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebUiSettings {
    #[serde(default = "default_webui_program")]
    pub program: String,
    #[serde(default = "default_webui_args")]
    pub args: Vec<String>,
    /// Working directory for the UI server. Defaults to `<toolkit.dir>/ui`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Port the UI server listens on.
    #[serde(default = "default_webui_port")]
    pub port: u16,
    /// Seconds to wait before announcing the server as reachable.
    #[serde(default = "default_startup_wait")]
    pub startup_wait_secs: u64,
    /// Seconds between volume commits while the server runs.
    #[serde(default = "default_commit_interval")]
    pub commit_interval_secs: u64,
}

impl Default for WebUiSettings {
    fn default() -> Self {
        Self {
            program: default_webui_program(),
            args: default_webui_args(),
            dir: None,
            port: default_webui_port(),
            startup_wait_secs: default_startup_wait(),
            commit_interval_secs: default_commit_interval(),
        }
    }
}

fn default_mount_dir() -> PathBuf {
    PathBuf::from("/app/ai-toolkit/modal_output")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/app/ai-toolkit/config")
}

fn default_toolkit_dir() -> PathBuf {
    PathBuf::from("/app/ai-toolkit")
}

fn default_toolkit_program() -> String {
    "python".to_string()
}

fn default_toolkit_args() -> Vec<String> {
    vec!["run.py".to_string()]
}

fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("DISABLE_TELEMETRY".to_string(), "YES".to_string()),
        ("HF_HUB_ENABLE_HF_TRANSFER".to_string(), "1".to_string()),
    ])
}

fn default_webui_program() -> String {
    "npm".to_string()
}

fn default_webui_args() -> Vec<String> {
    vec!["run".to_string(), "start".to_string()]
}

fn default_webui_port() -> u16 {
    8675
}

fn default_startup_wait() -> u64 {
    30
}

fn default_commit_interval() -> u64 {
    10
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration, falling back to defaults if the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            tracing::debug!(
                "No config at {}, using defaults",
                path.as_ref().display()
            );
            Ok(Self::default())
        }
    }

    /// Working directory of the web UI server.
    #[must_use]
    pub fn webui_dir(&self) -> PathBuf {
        self.webui
            .dir
            .clone()
            .unwrap_or_else(|| self.toolkit.dir.join("ui"))
    }
}

/// Load variables from an optional `.env` file into the process environment.
/// Variables already set are left alone. Returns whether a file was loaded.
pub fn load_env_file(path: impl AsRef<Path>) -> Result<bool, ConfigError> {
    let path = path.as_ref();
    match dotenvy::from_path(path) {
        Ok(()) => {
            tracing::debug!("Loaded environment from {}", path.display());
            Ok(true)
        }
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(ConfigError::Env(path.display().to_string(), e.to_string())),
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("failed to load environment file {0}: {1}")]
    Env(String, String),
}
