//! Replication model: host identifiers, modification entries and per-peer
//! change-log cursors.
//!
//! A store that takes part in replication implements [`EngineReplication`].
//! For every remote host it keeps a [`ModificationIterator`]: the set of
//! local changes that host has not been sent yet, plus a notifier that wakes
//! the task delivering them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{Error, Result, Value};

/// Identifies a host for loop avoidance and conflict resolution (0 to 127).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(u8);

impl HostId {
    pub const MAX: u8 = 127;

    pub fn new(id: u8) -> Result<Self> {
        if id > Self::MAX {
            return Err(Error::invalid_argument(format!(
                "host identifier {} is out of range 0..={}",
                id,
                Self::MAX
            )));
        }
        Ok(HostId(id))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Integer(self.0 as i64)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let id = value.as_i64().ok_or_else(|| {
            Error::protocol(format!("host identifier must be an integer: {}", value))
        })?;
        let id = u8::try_from(id)
            .map_err(|_| Error::protocol(format!("host identifier out of range: {}", id)))?;
        HostId::new(id).map_err(|e| Error::protocol(e.to_string()))
    }
}

impl Default for HostId {
    /// Host 1.
    fn default() -> Self {
        HostId(1)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One recorded mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEntry {
    pub key: Value,
    /// `None` records a removal.
    pub value: Option<Value>,
    pub origin: HostId,
    pub timestamp: u64,
    /// Set on entries re-sent because a peer bootstrapped, rather than on
    /// live mutations.
    pub bootstrap: bool,
}

impl ReplicationEntry {
    pub fn is_deleted(&self) -> bool {
        self.value.is_none()
    }

    pub fn to_value(&self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert("key".to_string(), self.key.clone());
        if let Some(value) = &self.value {
            fields.insert("value".to_string(), value.clone());
        }
        fields.insert("origin".to_string(), self.origin.to_value());
        fields.insert("timestamp".to_string(), Value::Integer(self.timestamp as i64));
        fields.insert("bootstrap".to_string(), Value::Bool(self.bootstrap));
        Value::Map(fields)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Map(mut fields) = value else {
            return Err(Error::protocol("replication entry must be a map"));
        };
        let key = fields
            .remove("key")
            .ok_or_else(|| Error::protocol("replication entry is missing 'key'"))?;
        let origin = HostId::from_value(
            fields
                .get("origin")
                .ok_or_else(|| Error::protocol("replication entry is missing 'origin'"))?,
        )?;
        let timestamp = timestamp_field(&fields, "timestamp")?;
        let bootstrap = fields
            .get("bootstrap")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(ReplicationEntry {
            key,
            value: fields.remove("value"),
            origin,
            timestamp,
            bootstrap,
        })
    }
}

/// The descriptor each side sends when a replication session starts: who it
/// is and the newest timestamp it has applied from the other side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub identifier: HostId,
    pub last_updated_time: u64,
}

impl Bootstrap {
    pub fn to_value(&self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert("identifier".to_string(), self.identifier.to_value());
        fields.insert(
            "lastUpdatedTime".to_string(),
            Value::Integer(self.last_updated_time as i64),
        );
        Value::Map(fields)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Map(fields) = value else {
            return Err(Error::protocol("bootstrap must be a map"));
        };
        let identifier = HostId::from_value(
            fields
                .get("identifier")
                .ok_or_else(|| Error::protocol("bootstrap is missing 'identifier'"))?,
        )?;
        Ok(Bootstrap {
            identifier,
            last_updated_time: timestamp_field(fields, "lastUpdatedTime")?,
        })
    }
}

fn timestamp_field(fields: &BTreeMap<String, Value>, name: &str) -> Result<u64> {
    fields
        .get(name)
        .and_then(Value::as_i64)
        .and_then(|t| u64::try_from(t).ok())
        .ok_or_else(|| Error::protocol(format!("'{}' must be a non-negative integer", name)))
}

/// The change-log cursor for one remote host.
///
/// Holds the latest not-yet-sent entry per key. Marking an entry wakes the
/// delivery task; draining takes the whole dirty set in one short critical
/// section and returns it in timestamp order.
#[derive(Debug)]
pub struct ModificationIterator {
    remote: HostId,
    dirty: Mutex<BTreeMap<Value, ReplicationEntry>>,
    notifier: Notify,
}

impl ModificationIterator {
    pub fn new(remote: HostId) -> Self {
        Self {
            remote,
            dirty: Mutex::new(BTreeMap::new()),
            notifier: Notify::new(),
        }
    }

    pub fn remote(&self) -> HostId {
        self.remote
    }

    /// Record an entry as not yet sent and wake the delivery task.
    pub fn mark(&self, entry: ReplicationEntry) {
        self.dirty.lock().insert(entry.key.clone(), entry);
        self.notifier.notify_one();
    }

    /// Take every dirty entry, oldest first.
    pub fn drain(&self) -> Vec<ReplicationEntry> {
        let taken = std::mem::take(&mut *self.dirty.lock());
        let mut entries: Vec<ReplicationEntry> = taken.into_values().collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.lock().is_empty()
    }

    /// Wait until something is marked. A mark that happened while nobody
    /// was waiting is not lost.
    pub async fn changed(&self) {
        self.notifier.notified().await
    }

    /// Wake the delivery task without marking anything.
    pub fn wake(&self) {
        self.notifier.notify_one();
    }
}

/// A store that can replicate with other hosts.
pub trait EngineReplication: Send + Sync {
    /// The local host identifier; entries created here carry it as origin.
    fn identifier(&self) -> HostId;

    /// Apply an entry received from a peer. Returns whether it changed the
    /// store; an entry that is not newer than what is stored for its key is
    /// discarded.
    fn apply_replication(&self, entry: &ReplicationEntry) -> Result<bool>;

    /// The cursor for `remote`, created on first use and kept for the life
    /// of the store.
    fn acquire_modification_iterator(&self, remote: HostId) -> Arc<ModificationIterator>;

    /// The newest timestamp applied from `remote`.
    fn last_modification_time(&self, remote: HostId) -> u64;

    /// Raise the newest timestamp applied from `remote`. Never lowers it.
    fn set_last_modification_time(&self, remote: HostId, timestamp: u64);

    /// Mark every local entry newer than `from_timestamp` dirty for `remote`.
    fn dirty_entries(&self, remote: HostId, from_timestamp: u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, ts: u64) -> ReplicationEntry {
        ReplicationEntry {
            key: Value::from(key),
            value: Some(Value::from("v")),
            origin: HostId::new(1).unwrap(),
            timestamp: ts,
            bootstrap: false,
        }
    }

    #[test]
    fn host_id_range() {
        assert!(HostId::new(0).is_ok());
        assert!(HostId::new(127).is_ok());
        assert!(HostId::new(128).is_err());
        assert!(HostId::from_value(&Value::Integer(300)).is_err());
        assert_eq!(HostId::from_value(&Value::Integer(5)).unwrap().get(), 5);
    }

    #[test]
    fn entry_value_round_trip() {
        let mut e = entry("k", 42);
        assert_eq!(ReplicationEntry::from_value(e.to_value()).unwrap(), e);
        e.value = None;
        e.bootstrap = true;
        assert_eq!(ReplicationEntry::from_value(e.to_value()).unwrap(), e);
    }

    #[test]
    fn bootstrap_value_round_trip() {
        let b = Bootstrap {
            identifier: HostId::new(2).unwrap(),
            last_updated_time: 99,
        };
        assert_eq!(Bootstrap::from_value(&b.to_value()).unwrap(), b);
        assert!(Bootstrap::from_value(&Value::Null).is_err());
    }

    #[test]
    fn drain_keeps_latest_per_key_in_timestamp_order() {
        let it = ModificationIterator::new(HostId::new(2).unwrap());
        it.mark(entry("b", 3));
        it.mark(entry("a", 1));
        it.mark(entry("a", 5));
        assert!(it.has_dirty());

        let drained = it.drain();
        let stamps: Vec<u64> = drained.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![3, 5]);
        assert!(!it.has_dirty());
        assert!(it.drain().is_empty());
    }

    #[tokio::test]
    async fn mark_before_wait_is_not_lost() {
        let it = ModificationIterator::new(HostId::new(2).unwrap());
        it.mark(entry("a", 1));
        tokio::time::timeout(std::time::Duration::from_secs(1), it.changed())
            .await
            .expect("notification should be pending");
    }
}
