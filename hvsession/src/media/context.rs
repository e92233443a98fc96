use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use tokio::process::Command;
use tracing::debug;

use super::ContextBuilder;

/// Size of a 3.5" high-density floppy.
pub const FLOPPY_SIZE: usize = 1_474_560;

/// Each half of the image minus one byte: guest input, then guest output.
const FLOPPY_CHANNEL: usize = FLOPPY_SIZE / 2 - 1;

/// Offset of the control byte that tells the guest data is waiting.
const FLOPPY_CONTROL: usize = FLOPPY_CHANNEL * 2;

/// Lay out `data` as a floppyIO image.
///
/// The payload occupies the input channel at offset 0, truncated to leave a
/// terminating zero. The control byte is set to 1.
pub fn floppy_image(data: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; FLOPPY_SIZE];
    let len = data.len().min(FLOPPY_CHANNEL - 1);
    image[..len].copy_from_slice(&data[..len]);
    image[FLOPPY_CONTROL] = 1;
    image
}

/// `context.sh` as read by the guest's contextualization agent.
pub fn context_script(user_data: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(user_data);
    format!("EC2_USER_DATA=\"{encoded}\"\nONE_CONTEXT_PATH=\"/var/lib/amiconfig\"\n")
}

/// Writes context media next to the VM.
#[derive(Debug, Clone)]
pub struct LocalContextBuilder {
    iso_tool: PathBuf,
}

impl LocalContextBuilder {
    pub fn new(iso_tool: impl Into<PathBuf>) -> Self {
        Self {
            iso_tool: iso_tool.into(),
        }
    }
}

fn unique_name(prefix: &str, ext: &str) -> String {
    format!("{prefix}-{}.{ext}", uuid::Uuid::new_v4().simple())
}

#[async_trait]
impl ContextBuilder for LocalContextBuilder {
    async fn floppy(&self, data: &str, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(unique_name("context", "img"));
        tokio::fs::write(&path, floppy_image(data.as_bytes()))
            .await
            .with_context(|| format!("writing floppy image: {}", path.display()))?;
        debug!(path = %path.display(), bytes = data.len(), "floppy context image written");
        Ok(path)
    }

    async fn iso(&self, data: &str, dir: &Path) -> Result<PathBuf> {
        let staging = dir.join(unique_name("context", "d"));
        tokio::fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("creating {}", staging.display()))?;
        tokio::fs::write(staging.join("context.sh"), context_script(data))
            .await
            .context("writing context.sh")?;

        let path = dir.join(unique_name("context", "iso"));
        let output = Command::new(&self.iso_tool)
            .args(["-quiet", "-J", "-R", "-V", "CONTEXT", "-o"])
            .arg(&path)
            .arg(&staging)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.iso_tool.display()));
        tokio::fs::remove_dir_all(&staging).await.ok();

        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} failed: {}", self.iso_tool.display(), stderr.trim());
        }
        debug!(path = %path.display(), "context iso written");
        Ok(path)
    }
}
