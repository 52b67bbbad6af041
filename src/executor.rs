//! Code executor collaborator
//!
//! The engine never runs code itself. It hands a cell's source to a
//! [`CodeExecutor`] and records whatever outputs come back. A failure inside
//! the executed code is an output with `success = false`, not an error.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::notebook::{Output, OutputKind};
use crate::{Error, Result};

/// Runs a code payload and returns its output units in order
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    async fn execute(&self, code: &str) -> Result<Vec<Output>>;
}

/// Executor spawning an interpreter process per execution
///
/// The code is passed as the final argument, e.g. `python3 -c <code>`.
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ProcessExecutor {
    /// Create from a command line such as `"python3 -c"`
    pub fn new(command: &str, timeout: Duration) -> Result<Self> {
        let mut parts = shell_words::split(command)
            .map_err(|e| Error::Config(format!("Invalid executor command: {}", e)))?;
        if parts.is_empty() {
            return Err(Error::Config("Executor command is empty".to_string()));
        }
        let program = parts.remove(0);

        Ok(Self {
            program,
            args: parts,
            working_dir: None,
            timeout,
        })
    }

    /// Build from configuration. Returns `None` when no command is set.
    pub fn from_config(config: &ExecutorConfig) -> Result<Option<Self>> {
        let Some(command) = config.command.as_deref() else {
            return Ok(None);
        };
        let mut executor = Self::new(command, config.timeout()?)?;
        if let Some(dir) = &config.working_dir {
            let expanded = shellexpand::tilde(dir);
            executor.working_dir = Some(PathBuf::from(expanded.as_ref()));
        }
        Ok(Some(executor))
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl CodeExecutor for ProcessExecutor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(&self, code: &str) -> Result<Vec<Output>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!("Executing {} bytes with {}", code.len(), self.program);

        let child = cmd
            .spawn()
            .map_err(|e| Error::Execution(format!("Failed to spawn {}: {}", self.program, e)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Execution timed out after {:?}", self.timeout);
                return Ok(vec![Output::failure(format!(
                    "Execution timed out after {}",
                    humantime::format_duration(self.timeout)
                ))]);
            }
        };

        let mut outputs = Vec::new();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
            outputs.push(Output::stream(stdout.trim_end_matches('\n')));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            outputs.push(Output {
                kind: OutputKind::Stream,
                payload: serde_json::json!({"name": "stderr", "text": stderr}),
                success: output.status.success(),
                error: None,
            });
        }

        if !output.status.success() {
            let detail = match output.status.code() {
                Some(code) => format!("Process exited with status {}", code),
                None => "Process terminated by signal".to_string(),
            };
            outputs.push(Output::failure(detail));
        }

        Ok(outputs)
    }
}
