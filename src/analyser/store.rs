//! Key/value boundary for running representations.
//!
//! Records live under `<capture_source>_<timestamp>`; the bare `<capture_source>` key holds
//! the sorted list of update timestamps. The store itself is external; [MemoryStore] is the
//! in-process stand-in and can be saved to a JSON file between runs.
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use super::containers::RunningRepresentation;
use super::fusion::fuse;
use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredRepresentation {
    /// Fused vector after this update.
    pub representation: Vec<f64>,
    /// Latest unfused vector.
    pub current_representation: Vec<f64>,
    pub labels: Vec<String>,
    pub confidences: Vec<f64>,
    pub other_ips: Vec<String>,
    pub model_hash: String,
}

pub fn record_key(source: &str, timestamp: f64) -> String {
    format!("{source}_{timestamp}")
}

pub fn timeline_key(source: &str) -> String {
    source.to_string()
}

pub trait RepresentationStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: String) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Loads a store written by [MemoryStore::save]. A missing file gives an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No saved state at {}, starting empty", path.display());
            return Ok(Self::new());
        }
        let entries: HashMap<String, String> = serde_json::from_slice(&fs::read(path)?)?;
        Ok(Self { entries: RwLock::new(entries) })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let entries = self.entries.read();
        let sorted: BTreeMap<&String, &String> = entries.iter().collect();
        fs::write(path, serde_json::to_vec_pretty(&sorted)?)?;
        Ok(())
    }
}

impl RepresentationStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }
}

/// Serialises read-fuse-write cycles per capture source.
pub struct RepresentationUpdater<S> {
    store: S,
    time_constant: f64,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: RepresentationStore> RepresentationUpdater<S> {
    pub fn new(store: S, time_constant: f64) -> Self {
        Self { store, time_constant, locks: Mutex::new(HashMap::new()) }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn lock_for(&self, source: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().entry(source.to_string()).or_default())
    }

    pub fn timeline(&self, source: &str) -> Result<Vec<f64>> {
        match self.store.get(&timeline_key(source))? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Last stored state for `source`, if any.
    pub fn latest(&self, source: &str) -> Result<Option<RunningRepresentation>> {
        let Some(&timestamp) = self.timeline(source)?.last() else {
            return Ok(None);
        };
        match self.store.get(&record_key(source, timestamp))? {
            Some(raw) => {
                let record: StoredRepresentation = serde_json::from_str(&raw)?;
                Ok(Some(RunningRepresentation { timestamp, vector: record.representation }))
            }
            None => {
                log::warn!("Timeline for {source} points at missing record {timestamp}");
                Ok(None)
            }
        }
    }

    /// Fuses new observations into the stored state of `source` and writes the result back.
    ///
    /// Returns the new state, or the old one unchanged when every observation was stale.
    pub fn update(
        &self,
        source: &str,
        vectors: &[Vec<f64>],
        timestamps: &[f64],
        other_ips: &[IpAddr],
    ) -> Result<Option<RunningRepresentation>> {
        let lock = self.lock_for(source);
        let _guard = lock.lock();

        let prior = self.latest(source)?;
        let fused = fuse(vectors, timestamps, prior.as_ref(), self.time_constant)?;

        let Some(state) = fused else {
            return Ok(None);
        };
        if prior.as_ref().map(|p| p.timestamp) == Some(state.timestamp) {
            return Ok(Some(state));
        }

        let current = timestamps
            .iter()
            .zip(vectors)
            .rev()
            .find(|(t, _)| **t == state.timestamp)
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let mut other_ips: Vec<String> = other_ips.iter().map(|ip| ip.to_string()).collect();
        other_ips.sort();
        other_ips.dedup();

        let record = StoredRepresentation {
            representation: state.vector.clone(),
            current_representation: current,
            other_ips,
            ..Default::default()
        };
        self.store.set(&record_key(source, state.timestamp), serde_json::to_string(&record)?)?;

        let mut timeline = self.timeline(source)?;
        timeline.push(state.timestamp);
        timeline.sort_by(|a, b| a.total_cmp(b));
        self.store.set(&timeline_key(source), serde_json::to_string(&timeline)?)?;

        log::debug!("Stored representation for {source} at {}", state.timestamp);
        Ok(Some(state))
    }
}
