//! In-memory store with a modification log.
//!
//! The leaf every local map ends in. Each key keeps a record of its value
//! (or a tombstone), the host that wrote it and a logical timestamp, which is
//! what replication needs for last-writer-wins. Removals leave tombstones so
//! that a peer bootstrapping later still learns about them.
//!
//! All mutations, including function evaluation, happen under one lock. A
//! mutation marks the entry dirty for every known peer and publishes a map
//! event before the lock is released. Lock order is store state, then the
//! subscription hub, then the peer table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::traits::require_non_null;
use crate::{
    EngineReplication, FunctionRegistry, HostId, KeyValueStore, MapAccess, MapEvent, MapFunction,
    ModificationIterator, ReplicationEntry, Result, SnapshotSource, Subscription, Value,
};

#[derive(Clone, Debug)]
struct Record {
    value: Option<Value>,
    origin: HostId,
    timestamp: u64,
}

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<Value, Record>,
    clock: u64,
}

impl State {
    fn live(&self, key: &Value) -> Option<&Value> {
        self.records.get(key).and_then(|r| r.value.as_ref())
    }

    fn live_entries(&self) -> Vec<(Value, Value)> {
        self.records
            .iter()
            .filter_map(|(k, r)| r.value.as_ref().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    fn live_len(&self) -> usize {
        self.records.values().filter(|r| r.value.is_some()).count()
    }
}

#[derive(Debug)]
struct PeerState {
    last_applied: u64,
    iterator: Arc<ModificationIterator>,
}

/// A [`KeyValueStore`] held in memory that can replicate with peers.
pub struct InMemoryStore {
    asset_name: String,
    identifier: HostId,
    functions: Arc<FunctionRegistry>,
    state: Mutex<State>,
    peers: Mutex<HashMap<HostId, PeerState>>,
    events: Option<Arc<dyn Subscription>>,
}

impl InMemoryStore {
    pub fn new(
        asset_name: impl Into<String>,
        identifier: HostId,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        Self {
            asset_name: asset_name.into(),
            identifier,
            functions,
            state: Mutex::new(State::default()),
            peers: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Publish mutations to `hub` and make this store the hub's bootstrap
    /// source.
    pub fn publishing_to(mut self, hub: Arc<dyn Subscription>) -> Arc<Self> {
        self.events = Some(hub.clone());
        let store = Arc::new(self);
        let source: Arc<dyn SnapshotSource> = store.clone();
        hub.attach_source(Arc::downgrade(&source));
        store
    }

    pub fn asset_name(&self) -> &str {
        &self.asset_name
    }

    /// Stamp and store a local mutation. Removing an absent key is a no-op.
    fn write_local(&self, state: &mut State, key: Value, value: Option<Value>) -> Option<Value> {
        let previous = state.live(&key).cloned();
        if previous.is_none() && value.is_none() {
            return None;
        }
        state.clock += 1;
        let timestamp = state.clock;
        state.records.insert(
            key.clone(),
            Record {
                value: value.clone(),
                origin: self.identifier,
                timestamp,
            },
        );
        let entry = ReplicationEntry {
            key,
            value,
            origin: self.identifier,
            timestamp,
            bootstrap: false,
        };
        self.publish(&entry.key, previous.clone(), entry.value.clone());
        for peer in self.peers.lock().values() {
            peer.iterator.mark(entry.clone());
        }
        previous
    }

    fn publish(&self, key: &Value, previous: Option<Value>, value: Option<Value>) {
        let Some(events) = &self.events else {
            return;
        };
        let asset_name = self.asset_name.clone();
        let key = key.clone();
        let event = match (previous, value) {
            (None, Some(value)) => MapEvent::Inserted {
                asset_name,
                key,
                value,
            },
            (Some(old), Some(value)) => MapEvent::Updated {
                asset_name,
                key,
                old_value: Some(old),
                value,
            },
            (Some(old_value), None) => MapEvent::Removed {
                asset_name,
                key,
                old_value,
            },
            (None, None) => return,
        };
        events.publish(event);
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("asset_name", &self.asset_name)
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

/// A store's state borrowed for the duration of one function evaluation.
struct Mutation<'a> {
    store: &'a InMemoryStore,
    state: &'a mut State,
}

impl MapAccess for Mutation<'_> {
    fn get(&self, key: &Value) -> Option<Value> {
        self.state.live(key).cloned()
    }

    fn put(&mut self, key: Value, value: Value) -> Option<Value> {
        self.store.write_local(self.state, key, Some(value))
    }

    fn remove(&mut self, key: &Value) -> Option<Value> {
        self.store.write_local(self.state, key.clone(), None)
    }

    fn len(&self) -> usize {
        self.state.live_len()
    }

    fn entries(&self) -> Vec<(Value, Value)> {
        self.state.live_entries()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &Value) -> Result<Option<Value>> {
        require_non_null(key, "key")?;
        Ok(self.state.lock().live(key).cloned())
    }

    async fn put(&self, key: Value, value: Value) -> Result<()> {
        self.get_and_put(key, value).await.map(|_| ())
    }

    async fn get_and_put(&self, key: Value, value: Value) -> Result<Option<Value>> {
        require_non_null(&key, "key")?;
        require_non_null(&value, "value")?;
        let mut state = self.state.lock();
        Ok(self.write_local(&mut state, key, Some(value)))
    }

    async fn remove(&self, key: &Value) -> Result<()> {
        self.get_and_remove(key).await.map(|_| ())
    }

    async fn get_and_remove(&self, key: &Value) -> Result<Option<Value>> {
        require_non_null(key, "key")?;
        let mut state = self.state.lock();
        Ok(self.write_local(&mut state, key.clone(), None))
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.state.lock().live_len() as u64)
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        for (key, _) in state.live_entries() {
            self.write_local(&mut state, key, None);
        }
        Ok(())
    }

    async fn put_all(&self, entries: Vec<(Value, Value)>) -> Result<()> {
        for (key, value) in &entries {
            require_non_null(key, "key")?;
            require_non_null(value, "value")?;
        }
        let mut state = self.state.lock();
        for (key, value) in entries {
            self.write_local(&mut state, key, Some(value));
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(Value, Value)>> {
        Ok(self.state.lock().live_entries())
    }

    async fn apply_to(&self, function: &MapFunction, arg: Value) -> Result<Value> {
        let mut state = self.state.lock();
        let mut access = Mutation {
            store: self,
            state: &mut *state,
        };
        function.apply(&mut access, arg, &self.functions)
    }

    async fn sync_update(
        &self,
        update: &MapFunction,
        update_arg: Value,
        returning: &MapFunction,
        returning_arg: Value,
    ) -> Result<Value> {
        let mut state = self.state.lock();
        let mut access = Mutation {
            store: self,
            state: &mut *state,
        };
        update.apply(&mut access, update_arg, &self.functions)?;
        returning.apply(&mut access, returning_arg, &self.functions)
    }

    fn as_replication(self: Arc<Self>) -> Option<Arc<dyn EngineReplication>> {
        Some(self)
    }
}

impl SnapshotSource for InMemoryStore {
    fn with_snapshot(&self, f: &mut dyn FnMut(Vec<(Value, Value)>)) {
        let state = self.state.lock();
        f(state.live_entries());
    }
}

impl EngineReplication for InMemoryStore {
    fn identifier(&self) -> HostId {
        self.identifier
    }

    fn apply_replication(&self, entry: &ReplicationEntry) -> Result<bool> {
        if entry.origin == self.identifier {
            tracing::trace!(key = %entry.key, "ignoring entry that originated here");
            return Ok(false);
        }
        require_non_null(&entry.key, "key")?;

        let applied = {
            let mut state = self.state.lock();
            state.clock = state.clock.max(entry.timestamp);
            let newer = match state.records.get(&entry.key) {
                None => true,
                Some(existing) => {
                    (entry.timestamp, entry.origin) > (existing.timestamp, existing.origin)
                }
            };
            if newer {
                let previous = state.live(&entry.key).cloned();
                state.records.insert(
                    entry.key.clone(),
                    Record {
                        value: entry.value.clone(),
                        origin: entry.origin,
                        timestamp: entry.timestamp,
                    },
                );
                self.publish(&entry.key, previous, entry.value.clone());
            } else {
                tracing::trace!(
                    key = %entry.key,
                    origin = %entry.origin,
                    timestamp = entry.timestamp,
                    "discarding stale entry"
                );
            }
            newer
        };

        self.set_last_modification_time(entry.origin, entry.timestamp);
        Ok(applied)
    }

    fn acquire_modification_iterator(&self, remote: HostId) -> Arc<ModificationIterator> {
        self.peers
            .lock()
            .entry(remote)
            .or_insert_with(|| PeerState {
                last_applied: 0,
                iterator: Arc::new(ModificationIterator::new(remote)),
            })
            .iterator
            .clone()
    }

    fn last_modification_time(&self, remote: HostId) -> u64 {
        self.peers
            .lock()
            .get(&remote)
            .map(|peer| peer.last_applied)
            .unwrap_or(0)
    }

    fn set_last_modification_time(&self, remote: HostId, timestamp: u64) {
        let mut peers = self.peers.lock();
        let peer = peers.entry(remote).or_insert_with(|| PeerState {
            last_applied: 0,
            iterator: Arc::new(ModificationIterator::new(remote)),
        });
        peer.last_applied = peer.last_applied.max(timestamp);
    }

    fn dirty_entries(&self, remote: HostId, from_timestamp: u64) {
        let iterator = self.acquire_modification_iterator(remote);
        let state = self.state.lock();
        let mut marked = 0usize;
        for (key, record) in &state.records {
            if record.origin == self.identifier && record.timestamp > from_timestamp {
                iterator.mark(ReplicationEntry {
                    key: key.clone(),
                    value: record.value.clone(),
                    origin: record.origin,
                    timestamp: record.timestamp,
                    bootstrap: true,
                });
                marked += 1;
            }
        }
        tracing::debug!(
            asset = %self.asset_name,
            remote = %remote,
            from_timestamp,
            marked,
            "re-dirtied entries for peer"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, SubscriptionHub, SubscriptionOptions};

    fn host(id: u8) -> HostId {
        HostId::new(id).unwrap()
    }

    fn store(id: u8) -> InMemoryStore {
        InMemoryStore::new("orders", host(id), Arc::new(FunctionRegistry::default()))
    }

    fn s(v: &str) -> Value {
        Value::from(v)
    }

    #[tokio::test]
    async fn basic_map_operations() {
        let store = store(1);
        assert_eq!(store.get_and_put(s("A"), s("1")).await.unwrap(), None);
        assert_eq!(store.get_and_put(s("A"), s("2")).await.unwrap(), Some(s("1")));
        store.put(s("B"), s("3")).await.unwrap();
        assert_eq!(store.size().await.unwrap(), 2);
        assert!(store.contains_key(&s("B")).await.unwrap());
        assert!(store.contains_value(&s("3")).await.unwrap());

        assert_eq!(store.get_and_remove(&s("A")).await.unwrap(), Some(s("2")));
        assert_eq!(store.get(&s("A")).await.unwrap(), None);
        assert_eq!(store.size().await.unwrap(), 1);

        store.clear().await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn null_keys_and_values_are_rejected() {
        let store = store(1);
        assert!(matches!(
            store.put(Value::Null, s("1")).await,
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            store.put(s("A"), Value::Null).await,
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            store.get(&Value::Null).await,
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn compound_operations_via_functions() {
        let store = store(1);
        assert_eq!(store.put_if_absent(s("A"), s("1")).await.unwrap(), None);
        assert_eq!(store.put_if_absent(s("A"), s("2")).await.unwrap(), Some(s("1")));
        assert_eq!(store.replace(s("B"), s("1")).await.unwrap(), None);
        assert!(!store.contains_key(&s("B")).await.unwrap());
        assert!(store.replace_if_equal(s("A"), s("1"), s("5")).await.unwrap());
        assert!(!store.remove_if_equal(s("A"), s("1")).await.unwrap());
        assert!(store.remove_if_equal(s("A"), s("5")).await.unwrap());

        let counter = MapFunction::Compute("increment".into());
        let result = store
            .sync_update(
                &counter,
                Value::Array(vec![s("n")]),
                &MapFunction::Named("size".into()),
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Integer(1));
        assert_eq!(store.get(&s("n")).await.unwrap(), Some(Value::Integer(1)));
    }

    #[tokio::test]
    async fn hash_code_depends_on_contents_only() {
        let a = store(1);
        let b = store(2);
        a.put(s("x"), s("1")).await.unwrap();
        a.put(s("y"), s("2")).await.unwrap();
        b.put(s("y"), s("2")).await.unwrap();
        b.put(s("x"), s("1")).await.unwrap();
        assert_eq!(a.hash_code().await.unwrap(), b.hash_code().await.unwrap());
    }

    #[tokio::test]
    async fn mutations_publish_events() {
        let hub = Arc::new(SubscriptionHub::new("orders"));
        let store = store(1).publishing_to(hub.clone());
        store.put(s("A"), s("1")).await.unwrap();

        let mut subscriber = hub
            .register_subscriber(SubscriptionOptions::default())
            .await
            .unwrap();
        store.put(s("A"), s("2")).await.unwrap();
        store.remove(&s("A")).await.unwrap();
        store.remove(&s("A")).await.unwrap();

        let first = subscriber.next_event().await.unwrap();
        assert!(matches!(first, MapEvent::Inserted { .. }));
        assert_eq!(
            subscriber.next_event().await,
            Some(MapEvent::Updated {
                asset_name: "orders".into(),
                key: s("A"),
                old_value: Some(s("1")),
                value: s("2"),
            })
        );
        assert_eq!(
            subscriber.next_event().await,
            Some(MapEvent::Removed {
                asset_name: "orders".into(),
                key: s("A"),
                old_value: s("2"),
            })
        );
        assert!(subscriber.try_recv().is_none());
    }

    #[tokio::test]
    async fn local_writes_mark_known_peers() {
        let store = store(1);
        store.put(s("before"), s("0")).await.unwrap();
        let iterator = store.acquire_modification_iterator(host(2));
        assert!(!iterator.has_dirty());

        store.put(s("A"), s("1")).await.unwrap();
        store.remove(&s("A")).await.unwrap();
        let drained = iterator.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].is_deleted());
        assert_eq!(drained[0].origin, host(1));

        store.dirty_entries(host(2), 0);
        let resent = iterator.drain();
        assert_eq!(resent.len(), 2);
        assert!(resent.iter().all(|e| e.bootstrap));
    }

    #[tokio::test]
    async fn last_writer_wins_regardless_of_arrival_order() {
        let older = ReplicationEntry {
            key: s("k"),
            value: Some(s("old")),
            origin: host(2),
            timestamp: 5,
            bootstrap: false,
        };
        let newer = ReplicationEntry {
            key: s("k"),
            value: Some(s("new")),
            origin: host(3),
            timestamp: 7,
            bootstrap: false,
        };

        let a = store(1);
        assert!(a.apply_replication(&older).unwrap());
        assert!(a.apply_replication(&newer).unwrap());

        let b = store(1);
        assert!(b.apply_replication(&newer).unwrap());
        assert!(!b.apply_replication(&older).unwrap());

        assert_eq!(a.get(&s("k")).await.unwrap(), Some(s("new")));
        assert_eq!(b.get(&s("k")).await.unwrap(), Some(s("new")));
    }

    #[tokio::test]
    async fn equal_timestamps_break_ties_on_origin() {
        let low = ReplicationEntry {
            key: s("k"),
            value: Some(s("low")),
            origin: host(2),
            timestamp: 4,
            bootstrap: false,
        };
        let high = ReplicationEntry {
            origin: host(3),
            value: Some(s("high")),
            ..low.clone()
        };
        let store = store(1);
        store.apply_replication(&high).unwrap();
        assert!(!store.apply_replication(&low).unwrap());
        assert_eq!(store.get(&s("k")).await.unwrap(), Some(s("high")));
    }

    #[tokio::test]
    async fn apply_advances_clock_and_last_applied() {
        let store = store(1);
        let remote = ReplicationEntry {
            key: s("k"),
            value: Some(s("v")),
            origin: host(2),
            timestamp: 40,
            bootstrap: false,
        };
        store.apply_replication(&remote).unwrap();
        assert_eq!(store.last_modification_time(host(2)), 40);

        // A stale re-apply is discarded and never lowers last-applied.
        let stale = ReplicationEntry {
            timestamp: 3,
            ..remote.clone()
        };
        assert!(!store.apply_replication(&stale).unwrap());
        store.set_last_modification_time(host(2), 10);
        assert_eq!(store.last_modification_time(host(2)), 40);

        // The next local write is stamped after everything observed.
        store.put(s("k"), s("local")).await.unwrap();
        let iterator = store.acquire_modification_iterator(host(2));
        store.dirty_entries(host(2), 40);
        let entries = iterator.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp, 41);
    }

    #[tokio::test]
    async fn own_entries_are_not_reapplied() {
        let store = store(1);
        let echo = ReplicationEntry {
            key: s("k"),
            value: Some(s("v")),
            origin: host(1),
            timestamp: 9,
            bootstrap: false,
        };
        assert!(!store.apply_replication(&echo).unwrap());
        assert_eq!(store.size().await.unwrap(), 0);
    }
}
