use std::collections::BTreeMap;
use log::{debug, info, warn};

/// Key/value namespace owned by one driver process
pub trait StateStore {
    fn set(&mut self, key: &str, value: &str);
    fn delete(&mut self, key: &str);
    fn get(&self, key: &str) -> Option<&str>;
    /// The device stopped answering, published values can not be trusted
    fn mark_stale(&mut self);
    fn mark_ok(&mut self);
}

/// In-memory state of one device, published as a whole after every commit
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    values: BTreeMap<String, String>,
    stale: bool,
    changed: bool,
}

impl DeviceState {
    pub fn new() -> Self {
        DeviceState::default()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns whether anything changed since the last call
    pub fn take_changed(&mut self) -> bool {
        std::mem::replace(&mut self.changed, false)
    }

    pub fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect()
    }
}

impl StateStore for DeviceState {
    fn set(&mut self, key: &str, value: &str) {
        if self.values.get(key).map(|v| v.as_str()) == Some(value) {
            return;
        }
        debug!("{key} = {value}");
        self.values.insert(key.to_string(), value.to_string());
        self.changed = true;
    }

    fn delete(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            debug!("{key} removed");
            self.changed = true;
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    fn mark_stale(&mut self) {
        if !self.stale {
            warn!("Data marked stale");
            self.stale = true;
            self.changed = true;
        }
    }

    fn mark_ok(&mut self) {
        if self.stale {
            info!("Data is fresh again");
            self.stale = false;
            self.changed = true;
        }
    }
}
