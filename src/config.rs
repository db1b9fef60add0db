//! Configuration loading and validation.
//!
//! Config files are TOML by default. A `.json` file is read with the same
//! schema, and also accepts the camelCase keys (`mcpServers`, `baseUrl`,
//! `allowedDirectory`) used by older bridge deployments.

use crate::error::{ConfigError, Result};
use crate::worker::CorrelationMode;

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Bridge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Model endpoint settings.
    pub llm: LlmConfig,

    /// HTTP front door settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker call settings shared by every worker.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Worker processes to launch at startup.
    #[serde(default, alias = "mcpServers")]
    pub workers: Vec<WorkerSpec>,
}

/// Model endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// Model name passed through to the endpoint.
    pub model: String,

    /// Base URL of the chat endpoint, e.g. `http://localhost:11434`.
    #[serde(alias = "baseUrl")]
    pub base_url: String,

    #[serde(default = "default_request_timeout_secs", alias = "requestTimeoutSecs")]
    pub request_timeout_secs: u64,
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Deadline for one worker call, measured from the moment the request
    /// is about to be written.
    #[serde(default = "default_call_timeout_secs", alias = "callTimeoutSecs")]
    pub call_timeout_secs: u64,
}

impl BridgeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

/// Static launch configuration for one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSpec {
    /// Unique worker name; also the tool name prefix the model sees.
    pub name: String,

    /// Executable to launch. When absent the worker is started as
    /// `npx @modelcontextprotocol/server-<name>`.
    #[serde(default, alias = "launchCommand")]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Directory handed to the worker as its last argument.
    #[serde(default, alias = "allowedDirectory", alias = "working_directory")]
    pub allowed_directory: Option<String>,

    /// Script launched with the same directory argument when the primary
    /// command cannot be started.
    #[serde(default, alias = "fallbackScript")]
    pub fallback_script: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub correlation: CorrelationMode,
}

impl WorkerSpec {
    /// Spec with only a name and command, everything else defaulted.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            args: Vec::new(),
            allowed_directory: None,
            fallback_script: None,
            enabled: true,
            env: HashMap::new(),
            correlation: CorrelationMode::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationMode) -> Self {
        self.correlation = correlation;
        self
    }
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_call_timeout_secs() -> u64 {
    5
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from an explicit path, or from the first default
    /// location that exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => {
                let candidates = Self::default_paths();
                let found = candidates.iter().find(|candidate| candidate.is_file());
                match found {
                    Some(path) => Self::load_from_path(path),
                    None => Err(ConfigError::NotFound {
                        tried: candidates
                            .iter()
                            .map(|candidate| candidate.display().to_string())
                            .collect::<Vec<_>>()
                            .join(", "),
                    }
                    .into()),
                }
            }
        }
    }

    /// Load from a specific config file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(source),
        })?;

        let is_json = path
            .extension()
            .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));

        let config = if is_json {
            Self::from_json_str(&contents)
        } else {
            Self::from_toml_str(&contents)
        }
        .map_err(|error| match error {
            crate::Error::Config(ConfigError::Parse { message, .. }) => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            }
            .into(),
            other => other,
        })?;

        tracing::info!(
            path = %path.display(),
            workers = config.workers.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).map_err(|error| ConfigError::Parse {
            path: "<toml>".into(),
            message: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(contents).map_err(|error| ConfigError::Parse {
                path: "<json>".into(),
                message: error.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Locations searched when no `--config` is given, in order.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml"), PathBuf::from("config.json")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("toolbridge").join("config.toml"));
        }
        paths
    }

    fn validate(&self) -> Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.model must not be empty".into()).into());
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.base_url must not be empty".into()).into());
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(
                ConfigError::Invalid("llm.request_timeout_secs must be positive".into()).into(),
            );
        }
        if self.bridge.call_timeout_secs == 0 {
            return Err(
                ConfigError::Invalid("bridge.call_timeout_secs must be positive".into()).into(),
            );
        }

        let mut seen = HashSet::new();
        for spec in &self.workers {
            if spec.name.trim().is_empty() {
                return Err(ConfigError::Invalid("worker name must not be empty".into()).into());
            }
            if spec.name.contains('.') {
                return Err(ConfigError::Invalid(format!(
                    "worker name '{}' must not contain '.'",
                    spec.name
                ))
                .into());
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(
                    ConfigError::Invalid(format!("duplicate worker name '{}'", spec.name)).into(),
                );
            }
        }

        Ok(())
    }
}
