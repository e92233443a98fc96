pub mod context;
pub mod download;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::fsm::Progress;

pub use context::LocalContextBuilder;
pub use download::CachedDownloads;

/// How a downloaded file is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    /// Expected SHA-256, hex encoded.
    Sha256(String),
    /// URL of a file whose first token is the expected SHA-256.
    Url(String),
}

/// Fetches remote media into a local cache.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Download `url`, verify it and return the local path. `.gz` payloads
    /// are returned decompressed.
    async fn fetch(
        &self,
        url: &str,
        checksum: &Checksum,
        progress: Arc<dyn Progress>,
    ) -> Result<PathBuf>;
}

/// Produces the medium carrying user data into the guest.
#[async_trait]
pub trait ContextBuilder: Send + Sync {
    /// Floppy image in floppyIO layout.
    async fn floppy(&self, data: &str, dir: &Path) -> Result<PathBuf>;
    /// ISO image with the user data in `context.sh`.
    async fn iso(&self, data: &str, dir: &Path) -> Result<PathBuf>;
}
