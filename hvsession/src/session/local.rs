use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hypervisor::MachineState;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Persisted {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    values: BTreeMap<String, String>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

/// Key/value store backed by a JSON file.
#[derive(Debug)]
pub struct LocalState {
    path: PathBuf,
    data: Persisted,
}

impl LocalState {
    /// Open the store at `path`; a missing file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let mut state = Self {
            path: path.into(),
            data: Persisted::default(),
        };
        state.reload()?;
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, picking up changes made by other processes.
    pub fn reload(&mut self) -> Result<()> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no local state file");
            return Ok(());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading local state: {}", self.path.display()))?;
        let persisted: Persisted = serde_json::from_str(&data)
            .with_context(|| format!("parsing local state: {}", self.path.display()))?;
        if persisted.schema_version > SCHEMA_VERSION {
            warn!(
                version = persisted.schema_version,
                "local state has a newer schema version than supported, some fields may be lost"
            );
        }
        self.data = persisted;
        Ok(())
    }

    /// Write the file atomically with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating state dir: {}", dir.display()))?;
        }
        let persisted = Persisted {
            schema_version: SCHEMA_VERSION,
            ..self.data.clone()
        };
        let data = serde_json::to_string_pretty(&persisted).context("serializing local state")?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &data)
            .with_context(|| format!("writing temp state file: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming temp state file to: {}", self.path.display()))?;

        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&self.path, perms).ok();
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.values.get(key).map(String::as_str)
    }

    pub fn get_num<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.values.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.data.values.insert(key.into(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) {
        self.data.values.remove(key);
    }

    /// Forget every value. Properties are kept.
    pub fn clear(&mut self) {
        self.data.values.clear();
    }

    /// Last recorded coarse state; `Missing` when never recorded.
    pub fn state(&self) -> MachineState {
        self.get("state")
            .and_then(MachineState::parse)
            .unwrap_or_default()
    }

    pub fn set_state(&mut self, state: MachineState) {
        self.set("state", state.as_str());
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.data.properties.get(name).map(String::as_str)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.data.properties.insert(name.into(), value.into());
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.data.values
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.data.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = LocalState::load(dir.path().join("vm.json")).unwrap();
        assert_eq!(state.get("vboxid"), None);
        assert_eq!(state.state(), MachineState::Missing);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("vm.json");

        let mut state = LocalState::load(&path).unwrap();
        state.set("vboxid", "abc");
        state.set("apiPort", 8080);
        state.set_state(MachineState::Saved);
        state.set_property("owner", "alice");
        state.save().unwrap();

        let reopened = LocalState::load(&path).unwrap();
        assert_eq!(reopened.get("vboxid"), Some("abc"));
        assert_eq!(reopened.get_num::<u16>("apiPort"), Some(8080));
        assert_eq!(reopened.state(), MachineState::Saved);
        assert_eq!(reopened.property("owner"), Some("alice"));
        assert!(!path.with_extension("tmp").exists());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_reload_sees_other_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.json");
        let mut mine = LocalState::load(&path).unwrap();
        mine.set_state(MachineState::Running);
        mine.save().unwrap();

        let mut theirs = LocalState::load(&path).unwrap();
        theirs.set_state(MachineState::PowerOff);
        theirs.save().unwrap();

        assert_eq!(mine.state(), MachineState::Running);
        mine.reload().unwrap();
        assert_eq!(mine.state(), MachineState::PowerOff);
    }

    #[test]
    fn test_clear_keeps_properties() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = LocalState::load(dir.path().join("vm.json")).unwrap();
        state.set("vboxid", "abc");
        state.set_property("label", "x");
        state.clear();
        assert!(!state.contains("vboxid"));
        assert_eq!(state.property("label"), Some("x"));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(LocalState::load(&path).is_err());
    }
}
