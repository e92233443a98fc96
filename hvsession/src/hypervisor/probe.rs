use std::io::SeekFrom;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::MachineState;

/// How much of the end of the log is inspected.
pub const LOG_TAIL_BYTES: u64 = 80 * 1024;

/// Head of the log scanned for the process id.
const LOG_HEAD_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogReport {
    /// Latest power state the log reports, if any transition was seen.
    pub state: Option<MachineState>,
    /// Latest display mode.
    pub resolution: Option<Resolution>,
}

fn state_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Changing the VM state from '([A-Z_]+)' to '([A-Z_]+)'")
            .expect("invalid state regex")
    })
}

fn resize_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Display::handleDisplayResize.*\bw=(\d+) h=(\d+) bpp=(\d+)")
            .expect("invalid resize regex")
    })
}

fn pid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Process ID: (\d+)").expect("invalid pid regex"))
}

/// Scan log text for the most recent state transition and display mode.
///
/// Entering `SAVING` pins the result to saved and ends the scan; nothing a
/// saving VM logs afterwards changes that outcome.
pub fn analyze(text: &str) -> LogReport {
    let mut report = LogReport::default();
    for line in text.lines() {
        if let Some(caps) = state_re().captures(line) {
            match &caps[2] {
                "RUNNING" => report.state = Some(MachineState::Running),
                "SUSPENDED" => report.state = Some(MachineState::Paused),
                "OFF" => report.state = Some(MachineState::PowerOff),
                "SAVING" => {
                    report.state = Some(MachineState::Saved);
                    break;
                }
                _ => {}
            }
        } else if let Some(caps) = resize_re().captures(line) {
            let field = |i: usize| caps[i].parse::<u32>().unwrap_or(0);
            report.resolution = Some(Resolution {
                width: field(1),
                height: field(2),
                bpp: field(3),
            });
        }
    }
    report
}

/// Read and analyze the tail of a log file.
pub async fn probe(path: &Path) -> Result<LogReport> {
    let text = read_tail_bytes(path, LOG_TAIL_BYTES).await?;
    Ok(analyze(&text))
}

/// Process id of the VM front-end, as recorded near the top of the log.
pub async fn read_pid(path: &Path) -> Result<Option<u32>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening log: {}", path.display()))?;
    let mut head = Vec::new();
    (&mut file)
        .take(LOG_HEAD_BYTES)
        .read_to_end(&mut head)
        .await
        .with_context(|| format!("reading log: {}", path.display()))?;
    let text = String::from_utf8_lossy(&head);
    Ok(pid_re()
        .captures(&text)
        .and_then(|caps| caps[1].parse().ok()))
}

/// Read at most the last `limit` bytes of a file as text.
pub async fn read_tail_bytes(path: &Path, limit: u64) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening log: {}", path.display()))?;
    let len = file
        .metadata()
        .await
        .with_context(|| format!("stat log: {}", path.display()))?
        .len();
    if len > limit {
        file.seek(SeekFrom::Start(len - limit)).await?;
    }
    let mut buf = Vec::with_capacity(len.min(limit) as usize);
    file.read_to_end(&mut buf)
        .await
        .with_context(|| format!("reading log: {}", path.display()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
