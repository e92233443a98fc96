//! Subcommand implementations for the `hvsession` binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use hvsession::config::Config;
use hvsession::session::{session_graph, LocalState, Parameters, SessionDeps, VmSession};

/// Parse a `key=value` command-line pair.
pub fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

// ---------------------------------------------------------------------------
// session commands
// ---------------------------------------------------------------------------

/// What a session command asks of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Stop,
    Pause,
    Resume,
    Hibernate,
    Destroy,
}

/// Open the session, discover the machine, run `transition` to completion
/// and print the outcome as JSON.
pub async fn run_transition(
    config: Config,
    id: &str,
    params: Vec<(String, String)>,
    user_data: Vec<(String, String)>,
    transition: Transition,
) -> Result<()> {
    let deps = SessionDeps::from_config(&config);
    let session = VmSession::new(id, params.into_iter().collect::<Parameters>(), config, deps)?;

    session.open();
    if !session.wait().await {
        session.abort().await;
        anyhow::bail!("timed out discovering session {id}");
    }

    match transition {
        Transition::Start => session.start(user_data.into_iter().collect::<BTreeMap<_, _>>()),
        Transition::Stop => session.stop(),
        Transition::Pause => session.pause(),
        Transition::Resume => session.resume(),
        Transition::Hibernate => session.hibernate(),
        Transition::Destroy => session.close(),
    };
    let finished = session.wait().await;
    session.abort().await;

    print_report(&session)?;
    if !finished {
        anyhow::bail!("timed out waiting for {transition:?} on session {id}");
    }
    Ok(())
}

/// Change the CPU execution cap of a session's machine.
pub async fn run_execution_cap(
    config: Config,
    id: &str,
    params: Vec<(String, String)>,
    cap: u32,
) -> Result<()> {
    let deps = SessionDeps::from_config(&config);
    let session = VmSession::new(id, params.into_iter().collect::<Parameters>(), config, deps)?;
    session.open();
    session.wait().await;
    let result = session.set_execution_cap(cap).await;
    session.abort().await;
    result.with_context(|| format!("setting execution cap of {id}"))?;
    print_report(&session)
}

fn print_report(session: &Arc<VmSession>) -> Result<()> {
    let error = session.error_context();
    let report = json!({
        "id": session.id(),
        "state": session.state(),
        "node": format!("{:?}", session.current()),
        "api": session.api_port().map(|port| format!(
            "{}:{port}",
            session.api_host().unwrap_or_else(|| "127.0.0.1".into())
        )),
        "rdp": session.rdp_address(),
        "video_mode": session.video_mode(),
        "error": error.code.map(|_| error.clone()),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Print the persisted state of one session, or list every known session.
/// Reads the state directory only; the hypervisor is not queried.
pub fn run_status(config: &Config, id: Option<&str>) -> Result<()> {
    let dir = &config.session.state_dir;
    if let Some(id) = id {
        let path = config.session.state_file(id);
        if !path.exists() {
            println!("No state for session {id} at {}", path.display());
            return Ok(());
        }
        let local = LocalState::load(&path)?;
        println!("Session {id} (updated {} ago)", modified_ago(&path));
        println!("  state: {}", local.state());
        for (k, v) in local.values().iter().filter(|(k, _)| k.as_str() != "state") {
            println!("  {k}: {v}");
        }
        if !local.properties().is_empty() {
            println!("  properties:");
            for (k, v) in local.properties() {
                println!("    {k}: {v}");
            }
        }
        return Ok(());
    }

    if !dir.exists() {
        println!("No sessions yet ({} does not exist)", dir.display());
        return Ok(());
    }
    let mut ids: Vec<String> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension()? != "json" {
                return None;
            }
            path.file_stem()?.to_str().map(str::to_string)
        })
        .collect();
    ids.sort();

    println!("Sessions: {}", ids.len());
    for id in ids {
        let path = config.session.state_file(&id);
        match LocalState::load(&path) {
            Ok(local) => println!(
                "  {:<24} {:<10} {}",
                id,
                local.state().to_string(),
                local.get("vboxid").unwrap_or("-")
            ),
            Err(e) => println!("  {id:<24} unreadable: {e:#}"),
        }
    }
    Ok(())
}

fn modified_ago(path: &Path) -> String {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(format_duration)
        .unwrap_or_else(|| "unknown".to_string())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Verify the host can run sessions. Returns `Err` if any check fails.
pub fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        check_tool("VBoxManage", &config.hypervisor.binary, "--version", "Install VirtualBox"),
        check_tool("Download tool", &config.media.download_tool, "--version", "Install curl"),
        check_tool("ISO tool", &config.media.iso_tool, "--version", "Install genisoimage"),
        check_graph(),
        check_dir("State directory", &config.session.state_dir),
        check_dir("Machine directory", &config.session.runtime_dir),
        check_dir("Media cache", &config.media.cache_dir),
    ];

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if let Some(fix) = c.fix.as_ref().filter(|_| !c.ok) {
            println!("    Fix: {}", fix);
        }
    }

    println!();
    let failed = checks.iter().filter(|c| !c.ok).count();
    if failed == 0 {
        println!("All checks passed.");
        Ok(())
    } else {
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_tool(label: &'static str, binary: &Path, version_flag: &str, fix: &str) -> Check {
    match std::process::Command::new(binary).arg(version_flag).output() {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout);
            let version = version.lines().next().unwrap_or("unknown").trim().to_string();
            Check::pass(label, version)
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Check::fail(
                label,
                format!("{} exited with error: {}", binary.display(), stderr.trim()),
                fix,
            )
        }
        Err(e) => Check::fail(label, format!("{} not found: {}", binary.display(), e), fix),
    }
}

fn check_graph() -> Check {
    match session_graph() {
        Ok(_) => Check::pass("Session graph", "consistent"),
        Err(e) => Check::fail("Session graph", e.to_string(), "Report a bug"),
    }
}

fn check_dir(label: &'static str, dir: &Path) -> Check {
    if let Err(e) = std::fs::create_dir_all(dir) {
        return Check::fail(
            label,
            format!("{}: {}", dir.display(), e),
            format!("mkdir -p {}", dir.display()),
        );
    }
    let probe = dir.join(".hvsession-check");
    match std::fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Check::pass(label, dir.display().to_string())
        }
        Err(e) => Check::fail(
            label,
            format!("{} is not writable: {}", dir.display(), e),
            format!("Fix permissions on {}", dir.display()),
        ),
    }
}
