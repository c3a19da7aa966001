//! Presence table and state versioning.
//!
//! Presence entries are keyed by instance id (or connection id when no
//! instance id was presented) and are updated, never deleted. A disconnect
//! flips the entry's reason rather than removing it; readers that want
//! "currently online" filter by recency themselves.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceReason {
    Connect,
    Disconnect,
    NodeConnected,
    NodeDisconnected,
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    pub mode: PresenceMode,
    pub reason: PresenceReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_input_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Millisecond timestamp of the last update to this entry.
    pub ts: u64,
}

#[derive(Default)]
pub struct PresenceTable {
    entries: HashMap<String, PresenceEntry>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `key`, stamping the update time.
    pub fn upsert(&mut self, key: &str, mut entry: PresenceEntry) {
        entry.ts = now_ms();
        self.entries.insert(key.to_string(), entry);
    }

    /// Flip an existing entry to a disconnect-class reason. Entries are never
    /// removed. Returns false when the key was never tracked.
    pub fn mark_disconnected(&mut self, key: &str, reason: PresenceReason) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.reason = reason;
                entry.ts = now_ms();
                true
            }
            None => false,
        }
    }

    /// Re-stamp an entry with a periodic beacon, keeping its metadata.
    pub fn beacon(&mut self, key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.reason = PresenceReason::Periodic;
                entry.ts = now_ms();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&PresenceEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries as a JSON map, as sent in the hello payload
    /// and in presence events.
    pub fn snapshot(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (key, entry) in &self.entries {
            if let Ok(v) = serde_json::to_value(entry) {
                map.insert(key.clone(), v);
            }
        }
        Value::Object(map)
    }
}

/// Monotonic versions for the broadcastable state families. Attached to
/// snapshots and events so clients can detect staleness without replaying
/// history.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

#[derive(Debug, Default)]
pub struct StateVersionTracker {
    presence: u64,
    health: u64,
}

impl StateVersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump_presence(&mut self) -> u64 {
        self.presence += 1;
        self.presence
    }

    pub fn bump_health(&mut self) -> u64 {
        self.health += 1;
        self.health
    }

    pub fn current(&self) -> StateVersion {
        StateVersion {
            presence: self.presence,
            health: self.health,
        }
    }
}
