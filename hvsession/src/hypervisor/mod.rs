pub mod parse;
pub mod probe;
#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::HypervisorConfig;
use crate::util::command_line;

/// Exit code reported when the tool did not finish within its timeout.
pub const EXIT_TIMEOUT: i32 = -1000;
/// Exit code reported when the tool was terminated by a signal.
pub const EXIT_SIGNALLED: i32 = -1001;
/// Exit code reported when the tool could not be launched at all.
pub const EXIT_SPAWN_FAILED: i32 = -1002;

/// Maximum backoff delay between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Coarse power state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    #[default]
    Missing,
    PowerOff,
    Saved,
    Paused,
    Running,
}

impl MachineState {
    /// Map the `State` value of `showvminfo`, e.g. `powered off (since ...)`.
    pub fn from_info(state: &str) -> Option<Self> {
        if state.contains("running") {
            Some(MachineState::Running)
        } else if state.contains("paused") {
            Some(MachineState::Paused)
        } else if state.contains("saved") {
            Some(MachineState::Saved)
        } else if state.contains("aborted") || state.contains("powered off") {
            Some(MachineState::PowerOff)
        } else {
            None
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing" => Some(MachineState::Missing),
            "poweroff" => Some(MachineState::PowerOff),
            "saved" => Some(MachineState::Saved),
            "paused" => Some(MachineState::Paused),
            "running" => Some(MachineState::Running),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MachineState::Missing => "missing",
            MachineState::PowerOff => "poweroff",
            MachineState::Saved => "saved",
            MachineState::Paused => "paused",
            MachineState::Running => "running",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-invocation execution policy.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    /// Substrings of stderr that reclassify the result into a fixed code.
    pub error_strings: Vec<(String, i32)>,
}

impl ExecOptions {
    pub fn new(timeout: Duration, retries: u32, retry_delay: Duration) -> Self {
        Self {
            timeout,
            retries,
            retry_delay,
            error_strings: Vec::new(),
        }
    }

    pub fn from_config(config: &HypervisorConfig) -> Self {
        Self::new(
            Duration::from_secs(config.exec_timeout_secs),
            config.exec_retries,
            Duration::from_millis(config.retry_delay_ms),
        )
    }

    /// Report `code` whenever stderr contains `needle`.
    pub fn map_error(mut self, needle: &str, code: i32) -> Self {
        self.error_strings.push((needle.to_string(), code));
        self
    }

    pub fn classify(&self, stderr: &str) -> Option<i32> {
        self.error_strings
            .iter()
            .find(|(needle, _)| stderr.contains(needle.as_str()))
            .map(|(_, code)| *code)
    }
}

/// Result of one tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: Vec<String>,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: Vec<String>) -> Self {
        Self {
            code: 0,
            stdout,
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    fn from_output(output: std::process::Output) -> Self {
        let code = output.status.code().unwrap_or(EXIT_SIGNALLED);
        Self {
            code,
            stdout: String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::to_string)
                .collect(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

/// The hypervisor's command-line surface.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Run the tool with `args`. A non-zero exit is an `Ok` result; `Err`
    /// means the tool could not be run at all.
    async fn exec(&self, args: &[String], options: &ExecOptions) -> Result<ExecOutput>;
}

/// `VBoxManage` driven as a child process.
#[derive(Debug, Clone)]
pub struct VBoxManage {
    binary: PathBuf,
}

impl VBoxManage {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec_once(&self, args: &[String], timeout: Duration) -> Result<ExecOutput> {
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(timeout, child).await {
            Err(_) => Ok(ExecOutput::failed(
                EXIT_TIMEOUT,
                format!("timed out after {}s", timeout.as_secs()),
            )),
            Ok(output) => {
                let output = output
                    .with_context(|| format!("failed to execute {}", self.binary.display()))?;
                Ok(ExecOutput::from_output(output))
            }
        }
    }
}

#[async_trait]
impl ControlPlane for VBoxManage {
    #[instrument(skip_all, fields(verb = args.first().map(String::as_str).unwrap_or("")))]
    async fn exec(&self, args: &[String], options: &ExecOptions) -> Result<ExecOutput> {
        let program = self.binary.display().to_string();
        let mut attempt = 0;
        loop {
            debug!(command = %command_line(&program, args), attempt, "running");
            let result = self.exec_once(args, options.timeout).await?;

            if let Some(code) = options.classify(&result.stderr) {
                debug!(code, "known error string in output");
                return Ok(ExecOutput { code, ..result });
            }
            if result.success() || attempt >= options.retries {
                return Ok(result);
            }

            let delay = backoff_delay(options.retry_delay, attempt);
            debug!(
                code = result.code,
                stderr = %result.stderr,
                delay_ms = delay.as_millis() as u64,
                "command failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Compute the exponential backoff delay for a given attempt.
///
/// `attempt` is 0-indexed. The delay starts at `base` and doubles each
/// attempt, capping at `MAX_BACKOFF`.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    let delay = base.saturating_mul(multiplier);
    delay.min(MAX_BACKOFF)
}

/// Fluent builder for a tool argument vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args(Vec<String>);

impl Args {
    pub fn new(verb: &str) -> Self {
        Self(vec![verb.to_string()])
    }

    pub fn arg(mut self, value: impl ToString) -> Self {
        self.0.push(value.to_string());
        self
    }

    pub fn opt(mut self, flag: &str, value: impl ToString) -> Self {
        self.push_opt(flag, value);
        self
    }

    pub fn push_opt(&mut self, flag: &str, value: impl ToString) {
        self.0.push(flag.to_string());
        self.0.push(value.to_string());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}
