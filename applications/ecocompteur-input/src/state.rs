//! Key-value state surface shared with the host.
//!
//! Values are addressed by namespaced keys (`c1.power`, `cTotal.energy`,
//! `TICReading`, ...). Reads and writes are single-key operations; nothing
//! is transactional across keys.

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Number(f64),
    Text(String),
}

impl StateValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            StateValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            StateValue::Number(_) => None,
        }
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Number(v)
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Text(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Text(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    String,
}

/// Metadata describing a key, registered before the first write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    pub value_type: ValueType,
    /// "value" for numbers, "text" for labels
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl StateDefinition {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: ValueType::String,
            role: "text".into(),
            unit: None,
        }
    }

    pub fn number(name: impl Into<String>, unit: Option<&str>) -> Self {
        Self {
            name: name.into(),
            value_type: ValueType::Number,
            role: "value".into(),
            unit: unit.map(str::to_string),
        }
    }
}

pub trait StateStore: Send + Sync {
    /// Register `key` unless it already exists; existing definitions are kept.
    fn define(&self, key: &str, definition: &StateDefinition) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<StateValue>>;
    fn set(&self, key: &str, value: StateValue) -> Result<()>;
    /// Make every write since the last flush durable. Called once per poll.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    fn define(&self, key: &str, definition: &StateDefinition) -> Result<()> {
        (**self).define(key, definition)
    }

    fn get(&self, key: &str) -> Result<Option<StateValue>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: StateValue) -> Result<()> {
        (**self).set(key, value)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    definitions: BTreeMap<String, StateDefinition>,
    #[serde(default)]
    values: BTreeMap<String, StateValue>,
}

impl Snapshot {
    fn define(&mut self, key: &str, definition: &StateDefinition) -> bool {
        if self.definitions.contains_key(key) {
            return false;
        }
        self.definitions.insert(key.to_string(), definition.clone());
        true
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> AppError {
    AppError::State("state lock poisoned".into())
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn definition(&self, key: &str) -> Option<StateDefinition> {
        self.inner
            .lock()
            .ok()
            .and_then(|s| s.definitions.get(key).cloned())
    }

    /// Numeric value at `key`, `None` when absent or not a number.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).ok().flatten().and_then(|v| v.as_f64())
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key)
            .ok()
            .flatten()
            .and_then(|v| v.as_str().map(str::to_string))
    }
}

impl StateStore for MemoryStore {
    fn define(&self, key: &str, definition: &StateDefinition) -> Result<()> {
        self.inner.lock().map_err(poisoned)?.define(key, definition);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StateValue>> {
        Ok(self.inner.lock().map_err(poisoned)?.values.get(key).cloned())
    }

    fn set(&self, key: &str, value: StateValue) -> Result<()> {
        self.inner
            .lock()
            .map_err(poisoned)?
            .values
            .insert(key.to_string(), value);
        Ok(())
    }
}

/// JSON file backed store.
///
/// Writes land in memory; `flush` rewrites the file when anything changed.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: Mutex<Snapshot>,
    dirty: AtomicBool,
}

impl FileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = snapshot.values.len(), "opened state file");
        Ok(Self {
            path,
            inner: Mutex::new(snapshot),
            dirty: AtomicBool::new(false),
        })
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn define(&self, key: &str, definition: &StateDefinition) -> Result<()> {
        let mut snapshot = self.inner.lock().map_err(poisoned)?;
        if snapshot.define(key, definition) {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StateValue>> {
        Ok(self.inner.lock().map_err(poisoned)?.values.get(key).cloned())
    }

    fn set(&self, key: &str, value: StateValue) -> Result<()> {
        let mut snapshot = self.inner.lock().map_err(poisoned)?;
        snapshot.values.insert(key.to_string(), value);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let snapshot = self.inner.lock().map_err(poisoned)?;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.persist(&snapshot) {
            // Keep the changes pending so the next flush retries them.
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(path = %self.path.display(), keys = snapshot.values.len(), "state flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_define_keeps_existing_definition() {
        let store = MemoryStore::new();
        store
            .define("c1.power", &StateDefinition::number("c1 instantaneous power", Some("W")))
            .unwrap();
        store
            .define("c1.power", &StateDefinition::text("something else"))
            .unwrap();

        let def = store.definition("c1.power").unwrap();
        assert_eq!(def.value_type, ValueType::Number);
        assert_eq!(def.unit.as_deref(), Some("W"));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "ecocompteur-state-{}/state.json",
            std::process::id()
        ));
        std::fs::remove_file(&path).ok();

        {
            let store = FileStore::open(&path).unwrap();
            store
                .define("c1.energy", &StateDefinition::number("c1 energy", Some("kWh")))
                .unwrap();
            store.set("c1.energy", 1.25.into()).unwrap();
            store.set("c1.label", "Kitchen".into()).unwrap();
            store.flush().unwrap();
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("c1.energy").unwrap(), Some(StateValue::Number(1.25)));
        assert_eq!(
            reopened.get("c1.label").unwrap(),
            Some(StateValue::Text("Kitchen".into()))
        );
        assert_eq!(reopened.get("c2.energy").unwrap(), None);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_file_store_writes_only_on_flush() {
        let path = std::env::temp_dir().join(format!(
            "ecocompteur-flush-{}/state.json",
            std::process::id()
        ));
        std::fs::remove_file(&path).ok();

        let store = FileStore::open(&path).unwrap();
        store.set("c1.power", 150.0.into()).unwrap();
        store.set("c2.power", 20.0.into()).unwrap();
        assert!(!path.exists());
        assert_eq!(store.get("c1.power").unwrap(), Some(StateValue::Number(150.0)));

        store.flush().unwrap();
        assert_eq!(
            FileStore::open(&path).unwrap().get("c2.power").unwrap(),
            Some(StateValue::Number(20.0))
        );

        // Nothing pending: the file is left alone.
        std::fs::remove_file(&path).unwrap();
        store.flush().unwrap();
        assert!(!path.exists());

        store.set("c1.power", 0.0.into()).unwrap();
        store.flush().unwrap();
        assert_eq!(
            FileStore::open(&path).unwrap().get("c1.power").unwrap(),
            Some(StateValue::Number(0.0))
        );

        std::fs::remove_file(&path).ok();
    }
}
