//! The persisted source store.
//!
//! A JSON document mapping source names to descriptors:
//!
//! ```json
//! { "sources": { "morning-show": { "url": "/srv/audio/morning.flac" } } }
//! ```
//!
//! A descriptor is a URL plus an optional format hint and an opaque option
//! map handed through to the decoder. This file is the daemon's only durable
//! state.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl SourceSpec {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: None,
            options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigStore {
    #[serde(default)]
    sources: BTreeMap<String, SourceSpec>,
}

impl ConfigStore {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {path:?}"))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config {path:?}"))
    }

    /// Load the store, treating a missing file as empty.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                serde_json::from_str(&raw).with_context(|| format!("parse config {path:?}"))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read config {path:?}")),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("serialize config")?;
        std::fs::write(path, raw).with_context(|| format!("write config {path:?}"))
    }

    pub fn get(&self, name: &str) -> Option<&SourceSpec> {
        self.sources.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, spec: SourceSpec) {
        self.sources.insert(name.into(), spec);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.sources.remove(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SourceSpec)> {
        self.sources.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fondue-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn save_and_load_roundtrip() {
        let path = temp_path("config-roundtrip.json");
        let mut store = ConfigStore::default();
        store.insert("alpha", SourceSpec::from_url("/tmp/alpha.flac"));
        let mut spec = SourceSpec::from_url("/tmp/beta.mp3");
        spec.format = Some("mp3".into());
        spec.options.insert("probesize".into(), "4096".into());
        store.insert("beta", spec);
        store.save(&path).unwrap();

        let loaded = ConfigStore::load(&path).unwrap();
        assert_eq!(loaded.get("alpha").unwrap().url, "/tmp/alpha.flac");
        let beta = loaded.get("beta").unwrap();
        assert_eq!(beta.format.as_deref(), Some("mp3"));
        assert_eq!(beta.options.get("probesize").map(String::as_str), Some("4096"));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn load_or_default_tolerates_missing_file() {
        let path = temp_path("config-missing.json");
        let store = ConfigStore::load_or_default(&path).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn load_rejects_malformed_json() {
        let path = temp_path("config-bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(ConfigStore::load(&path).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn remove_reports_whether_the_entry_existed() {
        let mut store = ConfigStore::default();
        store.insert("gone", SourceSpec::from_url("x"));
        assert!(store.remove("gone"));
        assert!(!store.remove("gone"));
    }
}
