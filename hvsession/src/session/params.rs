use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Behaviour flags carried in the `flags` parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(u32);

impl Flags {
    pub const SYSTEM_64BIT: u32 = 0x01;
    /// Boot from a downloaded disk image instead of the micro ISO.
    pub const DEPLOYMENT_HDD: u32 = 0x02;
    pub const GUEST_ADDITIONS: u32 = 0x04;
    /// Deliver user data on a floppyIO image instead of a context ISO.
    pub const FLOPPY_IO: u32 = 0x08;
    /// Start with a visible window.
    pub const HEADFUL: u32 = 0x10;
    pub const GRAPHICAL: u32 = 0x20;
    /// Add a host-only second NIC instead of forwarding the API port.
    pub const DUAL_NIC: u32 = 0x40;

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// Key/value parameters of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, String>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Value of `key`, or `default` when unset.
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Numeric value of `key`; `default` when unset or unparsable.
    pub fn get_num<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn flags(&self) -> Flags {
        Flags(self.get_num("flags", 0))
    }

    /// Keys that user data passed to `start` may override.
    pub fn overridable(&self) -> Vec<String> {
        self.get("canOverride")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Copy every overridable key present in `user_data`.
    pub fn apply_overrides(&mut self, user_data: &BTreeMap<String, String>) {
        for key in self.overridable() {
            if let Some(value) = user_data.get(&key) {
                self.0.insert(key, value.clone());
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Parameters(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
