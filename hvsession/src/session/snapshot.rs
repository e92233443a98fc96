use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Last observed `showvminfo` attributes of a machine.
///
/// Handlers also patch entries directly after changing storage, so the
/// snapshot tracks what the session did even between queries.
#[derive(Debug, Clone)]
pub struct MachineSnapshot {
    info: BTreeMap<String, String>,
    taken: Option<Instant>,
    ttl: Duration,
}

impl MachineSnapshot {
    pub fn new(ttl: Duration) -> Self {
        Self {
            info: BTreeMap::new(),
            taken: None,
            ttl,
        }
    }

    /// True if the last query is recent enough to be reused.
    pub fn is_fresh(&self) -> bool {
        self.taken.is_some_and(|t| t.elapsed() < self.ttl) && !self.info.is_empty()
    }

    /// Replace all attributes with a new query result.
    pub fn replace(&mut self, info: BTreeMap<String, String>) {
        self.info = info;
        self.taken = Some(Instant::now());
    }

    /// Force the next query to hit the tool.
    pub fn invalidate(&mut self) {
        self.taken = None;
    }

    pub fn clear(&mut self) {
        self.info.clear();
        self.taken = None;
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.info.get(key).map(String::as_str)
    }

    /// Present and not set to `none`/empty.
    pub fn has_medium(&self, slot: &str) -> bool {
        self.get(slot)
            .is_some_and(|v| !v.is_empty() && !v.eq_ignore_ascii_case("none"))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.info.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.info.remove(key);
    }

    pub fn info(&self) -> &BTreeMap<String, String> {
        &self.info
    }
}
