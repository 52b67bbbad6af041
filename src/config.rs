//! Configuration loading and management

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::RetryPolicy;
use crate::workflow::{ExecutionControl, StartMode};
use crate::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Planning/generating gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Retry policy for gateway calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Step ceiling, start mode, interactivity
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Code executor (absent command = no executor)
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Custom-context overlay merged into every new session
    #[serde(default)]
    pub context: Map<String, Value>,
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| Error::Config(format!("Invalid duration for {}: '{}' ({})", field, value, e)))
}

impl Config {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .nbflow/config.toml in current directory
            let local = PathBuf::from(".nbflow/config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.nbflow/config.toml
            dirs::home_dir().map(|h| h.join(".nbflow/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                let config: Config = toml::from_str(&content)?;
                config.validate()?;
                Ok(config)
            }
            Some(p) if path.is_some() => Err(Error::Config(format!(
                "Config file not found: {}",
                p.display()
            ))),
            _ => Ok(Config::default()),
        }
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        self.gateway.timeout()?;
        self.retry_policy()?;
        self.executor.timeout()?;
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: parse_duration("retry.initial_delay", &self.retry.initial_delay)?,
            max_delay: parse_duration("retry.max_delay", &self.retry.max_delay)?,
        })
    }

    pub fn execution_control(&self) -> ExecutionControl {
        ExecutionControl::new(
            self.execution.max_steps,
            self.execution.start_mode,
            self.execution.interactive,
        )
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }
}

/// Gateway endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_planning_path")]
    pub planning_path: String,

    #[serde(default = "default_generating_path")]
    pub generating_path: String,

    /// Request the generating response as NDJSON stream
    #[serde(default = "default_true")]
    pub stream: bool,

    /// Per-request timeout
    #[serde(default = "default_gateway_timeout")]
    pub timeout: String,

    /// Bearer token (can also be in NBFLOW_API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_planning_path() -> String {
    "/planning".to_string()
}

fn default_generating_path() -> String {
    "/generating".to_string()
}

fn default_gateway_timeout() -> String {
    "120s".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            planning_path: default_planning_path(),
            generating_path: default_generating_path(),
            stream: true,
            timeout: default_gateway_timeout(),
            api_key: None,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Result<Duration> {
        parse_duration("gateway.timeout", &self.timeout)
    }

    pub fn planning_url(&self) -> String {
        join_url(&self.base_url, &self.planning_path)
    }

    pub fn generating_url(&self) -> String {
        join_url(&self.base_url, &self.generating_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> String {
    "500ms".to_string()
}

fn default_max_delay() -> String {
    "8s".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// Execution-control settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum dispatched actions (0 = unbounded)
    #[serde(default)]
    pub max_steps: u64,

    #[serde(default)]
    pub start_mode: StartMode,

    /// Pause at the step ceiling instead of stopping
    #[serde(default)]
    pub interactive: bool,
}

/// Code executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Interpreter command line, code is appended as last argument
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default = "default_executor_timeout")]
    pub timeout: String,
}

fn default_executor_timeout() -> String {
    "120s".to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: None,
            working_dir: None,
            timeout: default_executor_timeout(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Result<Duration> {
        parse_duration("executor.timeout", &self.timeout)
    }
}
