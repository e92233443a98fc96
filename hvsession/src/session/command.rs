use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::hypervisor::{Args, ControlPlane, ExecOptions, ExecOutput, EXIT_SPAWN_FAILED};

/// Serializes one session's invocations of the control-plane tool.
pub struct CommandAdapter {
    control: Arc<dyn ControlPlane>,
    options: ExecOptions,
    serial: Mutex<()>,
}

impl CommandAdapter {
    pub fn new(control: Arc<dyn ControlPlane>, options: ExecOptions) -> Self {
        Self {
            control,
            options,
            serial: Mutex::new(()),
        }
    }

    /// Base options, for callers that add error strings or change retries.
    pub fn options(&self) -> ExecOptions {
        self.options.clone()
    }

    pub async fn run(&self, args: Args) -> ExecOutput {
        self.run_with(args, &self.options).await
    }

    /// Run with custom options. A tool that cannot be launched is reported
    /// as [`EXIT_SPAWN_FAILED`].
    pub async fn run_with(&self, args: Args, options: &ExecOptions) -> ExecOutput {
        let _serial = self.serial.lock().await;
        match self.control.exec(args.as_slice(), options).await {
            Ok(out) => {
                if !out.success() {
                    debug!(
                        verb = args.as_slice().first().map(String::as_str).unwrap_or(""),
                        code = out.code,
                        stderr = %out.stderr,
                        "command returned non-zero"
                    );
                }
                out
            }
            Err(e) => {
                warn!(error = %e, "control-plane tool could not be run");
                ExecOutput::failed(EXIT_SPAWN_FAILED, e.to_string())
            }
        }
    }
}
