//! The store contract over a wire connection.

use std::sync::Arc;

use async_trait::async_trait;
use kvtree_core_store::{
    require_non_null, CollectionKind, CollectionView, Error, KeyValueStore, MapFunction, Result,
    Value,
};
use kvtree_wire::{Body, Connection, Handle, MapOp};

use crate::collection::RemoteCollection;

/// A [`KeyValueStore`] whose contents live on another host.
///
/// Null keys and values are rejected before anything is sent. `put`,
/// `remove` and `async_update` do not wait for the server; every other
/// operation is one round trip, compound operations included.
#[derive(Clone)]
pub struct RemoteKeyValueStore {
    connection: Connection,
    csp: String,
}

impl RemoteKeyValueStore {
    pub fn new(connection: Connection, csp: impl Into<String>) -> Self {
        Self {
            connection,
            csp: csp.into(),
        }
    }

    /// The capability path requests are addressed to.
    pub fn csp(&self) -> &str {
        &self.csp
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    async fn call(&self, op: MapOp, params: Vec<Value>) -> Result<Body> {
        self.connection
            .call(&self.csp, None, op.as_str(), params)
            .await
    }

    async fn call_value(&self, op: MapOp, params: Vec<Value>) -> Result<Value> {
        self.call(op, params).await?.into_value()
    }

    async fn call_option(&self, op: MapOp, params: Vec<Value>) -> Result<Option<Value>> {
        Ok(self.call_value(op, params).await?.into_option())
    }

    async fn call_bool(&self, op: MapOp, params: Vec<Value>) -> Result<bool> {
        let reply = self.call_value(op, params).await?;
        reply
            .as_bool()
            .ok_or_else(|| Error::protocol(format!("{} replied {}, expected a bool", op, reply)))
    }

    async fn send(&self, op: MapOp, params: Vec<Value>) -> Result<()> {
        self.connection
            .send(&self.csp, None, op.as_str(), params)
            .await
    }
}

fn require_entry(key: &Value, value: &Value) -> Result<()> {
    require_non_null(key, "key")?;
    require_non_null(value, "value")
}

#[async_trait]
impl KeyValueStore for RemoteKeyValueStore {
    async fn get(&self, key: &Value) -> Result<Option<Value>> {
        require_non_null(key, "key")?;
        self.call_option(MapOp::Get, vec![key.clone()]).await
    }

    async fn contains_key(&self, key: &Value) -> Result<bool> {
        require_non_null(key, "key")?;
        self.call_bool(MapOp::ContainsKey, vec![key.clone()]).await
    }

    async fn contains_value(&self, value: &Value) -> Result<bool> {
        require_non_null(value, "value")?;
        self.call_bool(MapOp::ContainsValue, vec![value.clone()]).await
    }

    async fn put(&self, key: Value, value: Value) -> Result<()> {
        require_entry(&key, &value)?;
        self.send(MapOp::Put, vec![key, value]).await
    }

    async fn get_and_put(&self, key: Value, value: Value) -> Result<Option<Value>> {
        require_entry(&key, &value)?;
        self.call_option(MapOp::GetAndPut, vec![key, value]).await
    }

    async fn remove(&self, key: &Value) -> Result<()> {
        require_non_null(key, "key")?;
        self.send(MapOp::Remove, vec![key.clone()]).await
    }

    async fn get_and_remove(&self, key: &Value) -> Result<Option<Value>> {
        require_non_null(key, "key")?;
        self.call_option(MapOp::GetAndRemove, vec![key.clone()]).await
    }

    async fn size(&self) -> Result<u64> {
        let size = self.call_value(MapOp::Size, vec![]).await?;
        size.as_i64()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| Error::protocol(format!("size replied {}", size)))
    }

    async fn clear(&self) -> Result<()> {
        self.call(MapOp::Clear, vec![]).await.map(|_| ())
    }

    async fn put_all(&self, entries: Vec<(Value, Value)>) -> Result<()> {
        for (key, value) in &entries {
            require_entry(key, value)?;
        }
        let entries = entries
            .into_iter()
            .map(|(key, value)| Value::entry(key, value))
            .collect();
        self.call(MapOp::PutAll, vec![Value::Array(entries)])
            .await
            .map(|_| ())
    }

    async fn apply_to(&self, function: &MapFunction, arg: Value) -> Result<Value> {
        self.call_value(MapOp::ApplyTo, vec![function.to_value(), arg])
            .await
    }

    async fn async_update(&self, function: &MapFunction, arg: Value) -> Result<()> {
        self.send(MapOp::AsyncUpdate, vec![function.to_value(), arg])
            .await
    }

    async fn sync_update(
        &self,
        update: &MapFunction,
        update_arg: Value,
        returning: &MapFunction,
        returning_arg: Value,
    ) -> Result<Value> {
        self.call_value(
            MapOp::SyncUpdate,
            vec![
                update.to_value(),
                update_arg,
                returning.to_value(),
                returning_arg,
            ],
        )
        .await
    }

    async fn put_if_absent(&self, key: Value, value: Value) -> Result<Option<Value>> {
        require_entry(&key, &value)?;
        self.call_option(MapOp::PutIfAbsent, vec![key, value]).await
    }

    async fn replace(&self, key: Value, value: Value) -> Result<Option<Value>> {
        require_entry(&key, &value)?;
        self.call_option(MapOp::Replace, vec![key, value]).await
    }

    async fn replace_if_equal(&self, key: Value, old: Value, new: Value) -> Result<bool> {
        require_entry(&key, &old)?;
        require_non_null(&new, "value")?;
        self.call_bool(MapOp::ReplaceIfEqual, vec![key, old, new])
            .await
    }

    async fn remove_if_equal(&self, key: Value, value: Value) -> Result<bool> {
        require_entry(&key, &value)?;
        self.call_bool(MapOp::RemoveIfEqual, vec![key, value]).await
    }

    async fn hash_code(&self) -> Result<i64> {
        let hash = self.call_value(MapOp::HashCode, vec![]).await?;
        hash.as_i64()
            .ok_or_else(|| Error::protocol(format!("hashCode replied {}", hash)))
    }

    async fn collection(&self, kind: CollectionKind) -> Result<Option<Arc<dyn CollectionView>>> {
        let op = match kind {
            CollectionKind::KeySet => MapOp::KeySet,
            CollectionKind::Values => MapOp::Values,
            CollectionKind::EntrySet => MapOp::EntrySet,
        };
        let handle = Handle::from_body(self.call(op, vec![]).await?)?;
        tracing::debug!(csp = %handle.csp, cid = handle.cid, "acquired remote handle");
        Ok(Some(Arc::new(RemoteCollection::new(
            self.connection.clone(),
            handle,
            kind,
        ))))
    }
}

impl std::fmt::Debug for RemoteKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteKeyValueStore")
            .field("csp", &self.csp)
            .field("peer", &self.connection.peer())
            .finish()
    }
}
