use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for hvsession.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hypervisor: HypervisorConfig,
    pub session: SessionConfig,
    pub media: MediaConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.hypervisor.binary.as_os_str().is_empty(),
            "hypervisor.binary must not be empty"
        );
        anyhow::ensure!(
            self.hypervisor.exec_timeout_secs >= 1,
            "hypervisor.exec_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.hypervisor.exec_retries <= 10,
            "hypervisor.exec_retries must be <= 10"
        );
        anyhow::ensure!(
            self.session.heal_window_secs >= 1,
            "session.heal_window_secs must be >= 1"
        );
        anyhow::ensure!(
            self.session.heal_budget >= 1,
            "session.heal_budget must be >= 1"
        );
        anyhow::ensure!(
            self.session.wait_timeout_secs >= 1,
            "session.wait_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.media.release_url.starts_with("http://")
                || self.media.release_url.starts_with("https://"),
            "media.release_url must be an http(s) URL"
        );
        anyhow::ensure!(
            !self.media.default_version.is_empty(),
            "media.default_version must not be empty"
        );
        Ok(())
    }
}

fn data_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("hvsession")
}

/// How the control-plane tool is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Path or name of the VBoxManage binary.
    pub binary: PathBuf,
    /// Per-invocation timeout.
    pub exec_timeout_secs: u64,
    /// Retries for a failing invocation (not applied to recognised errors).
    pub exec_retries: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_delay_ms: u64,
    /// Guest additions ISO, attached when a session asks for it.
    pub guest_additions_iso: Option<PathBuf>,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("VBoxManage"),
            exec_timeout_secs: 60,
            exec_retries: 2,
            retry_delay_ms: 500,
            guest_additions_iso: None,
        }
    }
}

/// Session behaviour and on-disk locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Where per-VM local state files live.
    pub state_dir: PathBuf,
    /// Base folder under which VM folders and generated media are created.
    pub runtime_dir: PathBuf,
    /// Errors closer together than this count against the retry budget.
    pub heal_window_secs: u64,
    /// Consecutive errors tolerated inside the window before giving up.
    pub heal_budget: u32,
    /// How long a `showvminfo` result is reused.
    pub snapshot_ttl_ms: u64,
    /// Upper bound for waiting on the worker to go idle.
    pub wait_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let root = data_root();
        Self {
            state_dir: root.join("state"),
            runtime_dir: root.join("machines"),
            heal_window_secs: 60,
            heal_budget: 4,
            snapshot_ttl_ms: 500,
            wait_timeout_secs: 900,
        }
    }
}

impl SessionConfig {
    pub fn heal_window(&self) -> Duration {
        Duration::from_secs(self.heal_window_secs)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Local state file of one session.
    pub fn state_file(&self, session_id: &str) -> PathBuf {
        self.state_dir.join(format!("{session_id}.json"))
    }
}

/// Boot media retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Content-addressed download cache.
    pub cache_dir: PathBuf,
    /// Base URL of micro-ISO releases.
    pub release_url: String,
    pub default_version: String,
    pub default_flavor: String,
    /// Tool used to fetch remote media.
    pub download_tool: PathBuf,
    /// Tool used to master context ISOs.
    pub iso_tool: PathBuf,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cache_dir: data_root().join("cache"),
            release_url: "https://cernvm.cern.ch/releases".into(),
            default_version: "1.18-10".into(),
            default_flavor: "prod".into(),
            download_tool: PathBuf::from("curl"),
            iso_tool: PathBuf::from("genisoimage"),
        }
    }
}
