//! Hierarchical key-value surface backing the metadata catalog.
//!
//! The production store (a replicated coordination service) sits behind
//! [`KvInterface`]; everything in this workspace reads through it and never
//! writes. [`MemKv`] is the in-memory implementation used by tests and by
//! deployments that load a dumped catalog snapshot.

use std::collections::BTreeMap;

use smq_common::{Result, SmqError};

/// Read-only view of a hierarchical key-value store.
///
/// Paths are `/`-separated, e.g. `/db/LSST/Object/partitioning/lon`.
pub trait KvInterface: Send + Sync {
    /// Whether a key exists.
    fn exists(&self, path: &str) -> Result<bool>;

    /// Value at `path`. Missing keys are an error; use [`KvInterface::exists`]
    /// to probe.
    fn get(&self, path: &str) -> Result<String>;

    /// Immediate child names under `path`, sorted.
    fn get_children(&self, path: &str) -> Result<Vec<String>>;
}

/// In-memory key-value store, loadable from a JSON object of path → value.
#[derive(Debug, Default, Clone)]
pub struct MemKv {
    entries: BTreeMap<String, String>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one key. Intermediate path components become implicit nodes
    /// with empty values so `exists`/`get_children` see them.
    pub fn set(&mut self, path: &str, value: &str) {
        let normalized = normalize(path);
        let mut prefix = String::new();
        for part in normalized.split('/').filter(|p| !p.is_empty()) {
            prefix.push('/');
            prefix.push_str(part);
            self.entries.entry(prefix.clone()).or_default();
        }
        self.entries.insert(normalized, value.to_string());
    }

    /// Build a store from a JSON object mapping paths to string values.
    pub fn from_json(text: &str) -> Result<Self> {
        let map: BTreeMap<String, String> = serde_json::from_str(text)
            .map_err(|e| SmqError::InvalidConfig(format!("catalog snapshot decode failed: {e}")))?;
        let mut kv = Self::new();
        for (path, value) in &map {
            kv.set(path, value);
        }
        Ok(kv)
    }

    /// Load a JSON snapshot from disk.
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

impl KvInterface for MemKv {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.entries.contains_key(&normalize(path)))
    }

    fn get(&self, path: &str) -> Result<String> {
        let key = normalize(path);
        self.entries
            .get(&key)
            .cloned()
            .ok_or_else(|| SmqError::Analysis(format!("no such metadata key: {key}")))
    }

    fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let key = normalize(path);
        let prefix = format!("{key}/");
        let mut children: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        children.dedup();
        Ok(children)
    }
}
