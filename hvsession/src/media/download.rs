use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Checksum, MediaProvider};
use crate::fsm::Progress;

/// Content cache keyed by checksum, filled through an external downloader.
#[derive(Debug, Clone)]
pub struct CachedDownloads {
    cache_dir: PathBuf,
    tool: PathBuf,
    timeout: Duration,
}

impl CachedDownloads {
    pub fn new(cache_dir: impl Into<PathBuf>, tool: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            tool: tool.into(),
            timeout: Duration::from_secs(1800),
        }
    }

    /// Where a verified download with this checksum and name is kept.
    pub fn cached_path(&self, sha256: &str, url: &str) -> PathBuf {
        let name = file_name(url);
        let name = name.strip_suffix(".gz").unwrap_or(&name);
        self.cache_dir.join(format!("{}-{}", &sha256[..12], name))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        debug!(%url, dest = %dest.display(), "downloading");
        let child = Command::new(&self.tool)
            .args(["-fsSL", "--retry", "3", "-o"])
            .arg(dest)
            .arg(url)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .with_context(|| format!("download of {url} timed out"))?
            .with_context(|| format!("failed to execute {}", self.tool.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("download of {} failed: {}", url, stderr.trim());
        }
        Ok(())
    }

    async fn expected_checksum(&self, checksum: &Checksum) -> Result<String> {
        let raw = match checksum {
            Checksum::Sha256(hex) => hex.clone(),
            Checksum::Url(url) => {
                let dest = self
                    .cache_dir
                    .join(format!("checksum-{}", uuid::Uuid::new_v4().simple()));
                self.download(url, &dest).await?;
                let text = tokio::fs::read_to_string(&dest).await;
                tokio::fs::remove_file(&dest).await.ok();
                text.with_context(|| format!("reading checksum from {url}"))?
            }
        };
        parse_checksum(&raw)
    }
}

#[async_trait]
impl MediaProvider for CachedDownloads {
    async fn fetch(
        &self,
        url: &str,
        checksum: &Checksum,
        progress: Arc<dyn Progress>,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| format!("creating cache dir: {}", self.cache_dir.display()))?;

        progress.doing("Resolving checksum");
        let expected = self.expected_checksum(checksum).await?;
        let stored = self.cached_path(&expected, url);
        if tokio::fs::try_exists(&stored).await.unwrap_or(false) {
            progress.done("Found in cache");
            return Ok(stored);
        }

        let part = self.cache_dir.join(format!("{expected}.part"));
        progress.doing("Downloading");
        if let Err(e) = self.download(url, &part).await {
            tokio::fs::remove_file(&part).await.ok();
            return Err(e);
        }

        progress.doing("Verifying");
        let actual = sha256_file(&part).await?;
        if actual != expected {
            tokio::fs::remove_file(&part).await.ok();
            bail!("checksum mismatch for {url}: expected {expected}, got {actual}");
        }

        if file_name(url).ends_with(".gz") {
            progress.doing("Decompressing");
            let (src, dst) = (part.clone(), stored.clone());
            tokio::task::spawn_blocking(move || gunzip(&src, &dst))
                .await
                .context("decompression task failed")??;
            tokio::fs::remove_file(&part).await.ok();
        } else {
            tokio::fs::rename(&part, &stored)
                .await
                .with_context(|| format!("storing {}", stored.display()))?;
        }

        info!(%url, path = %stored.display(), "media downloaded");
        progress.done("Downloaded");
        Ok(stored)
    }
}

/// Last path segment of a URL, without query or fragment.
fn file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "download".to_string(),
    }
}

/// First token of a checksum text, validated as SHA-256 hex.
fn parse_checksum(text: &str) -> Result<String> {
    let token = text.split_whitespace().next().unwrap_or("").to_lowercase();
    anyhow::ensure!(
        token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit()),
        "not a sha256 checksum: {:?}",
        text.trim()
    );
    Ok(token)
}

pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn gunzip(src: &Path, dst: &Path) -> Result<()> {
    let input = std::fs::File::open(src).with_context(|| format!("opening {}", src.display()))?;
    let output =
        std::fs::File::create(dst).with_context(|| format!("creating {}", dst.display()))?;
    let mut decoder = flate2::read::GzDecoder::new(BufReader::new(input));
    let mut writer = BufWriter::new(output);
    if let Err(e) = std::io::copy(&mut decoder, &mut writer) {
        std::fs::remove_file(dst).ok();
        return Err(e).with_context(|| format!("decompressing {}", src.display()));
    }
    Ok(())
}
