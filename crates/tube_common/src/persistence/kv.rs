//! Key-value tier - one JSON file, held in memory for fast startup reads.
//!
//! Writes go to a temp file that is renamed over the original, so a crash
//! mid-write leaves the previous contents intact.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

use super::durable::DurableStore;
use crate::error::{Result, TubeError};
use crate::types::{StorageTier, SyncRecord};

/// Namespace for per-user snapshots
pub const STATE_KEY_PREFIX: &str = "tube:state:";

/// Device identifier written after an identity is minted
pub const DEVICE_ID_KEY: &str = "tube:device-id";

pub fn state_key(user_id: &str) -> String {
    format!("{}{}", STATE_KEY_PREFIX, user_id)
}

pub struct JsonKvStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Value>>,
}

impl JsonKvStore {
    /// Open the store, loading existing entries. An unreadable file is moved
    /// aside and the store starts empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entries = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(map) => map,
                Err(e) => {
                    let aside = path.with_extension("corrupt");
                    warn!(path = %path.display(), error = %e, "Key-value file unreadable, moving aside");
                    let _ = fs::rename(&path, &aside);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), entries = entries.len(), "Opened key-value store");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_raw(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn put_raw(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let previous = entries.insert(key.to_string(), value);
        if let Err(e) = self.persist(&entries) {
            // keep memory in step with disk
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn device_id(&self) -> Option<String> {
        self.get_raw(DEVICE_ID_KEY)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|id| !id.trim().is_empty())
    }

    pub fn set_device_id(&self, id: &str) -> Result<()> {
        self.put_raw(DEVICE_ID_KEY, Value::String(id.to_string()))
    }

    fn persist(&self, entries: &BTreeMap<String, Value>) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)
            .map_err(|e| TubeError::LocalStorage(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| TubeError::LocalStorage(format!("rename {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

impl DurableStore for JsonKvStore {
    fn name(&self) -> &'static str {
        "json-kv"
    }

    fn tier(&self) -> StorageTier {
        StorageTier::KeyValue
    }

    fn get(&self, user_id: &str) -> Result<Option<SyncRecord>> {
        match self.get_raw(&state_key(user_id)) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn put(&self, record: &SyncRecord) -> Result<()> {
        self.put_raw(&state_key(&record.user_id), serde_json::to_value(record)?)
    }
}
