//! The map view: a typed, flag-aware map over a node's store.
//!
//! `MapView` is what callers normally hold. It checks keys and values
//! against the types declared in its request context, honours
//! `putReturnsNull` and `removeReturnsNull`, and turns the functional
//! operations (`compute`, `merge`, ...) into [`MapFunction`]s the store
//! evaluates atomically. Over a remote store each of those is one round
//! trip.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use crate::{
    Asset, CollectionKind, CollectionView, Error, KeyValueStore, MapCollection, MapEvent,
    MapFunction, RequestContext, Result, Subscriber, SubscriptionOptions, TypeRegistry, Value,
    ViewType,
};

/// A map over the store of one resource node.
pub struct MapView {
    ctx: RequestContext,
    asset: Weak<Asset>,
    store: Arc<dyn KeyValueStore>,
    types: Arc<TypeRegistry>,
}

impl MapView {
    /// Build a map view. Fails if the context names an unknown key or
    /// value type.
    pub fn new(
        ctx: RequestContext,
        asset: Weak<Asset>,
        store: Arc<dyn KeyValueStore>,
        types: Arc<TypeRegistry>,
    ) -> Result<Self> {
        types.resolve(ctx.key_type())?;
        types.resolve(ctx.value_type())?;
        Ok(Self {
            ctx,
            asset,
            store,
            types,
        })
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub(crate) fn check_key(&self, key: &Value) -> Result<()> {
        self.types.check(self.ctx.key_type(), key, "key")
    }

    pub(crate) fn check_value(&self, value: &Value) -> Result<()> {
        self.types.check(self.ctx.value_type(), value, "value")
    }

    pub async fn get(&self, key: &Value) -> Result<Option<Value>> {
        self.check_key(key)?;
        self.store.get(key).await
    }

    pub async fn contains_key(&self, key: &Value) -> Result<bool> {
        self.check_key(key)?;
        self.store.contains_key(key).await
    }

    pub async fn contains_value(&self, value: &Value) -> Result<bool> {
        self.check_value(value)?;
        self.store.contains_value(value).await
    }

    /// Store a value. Returns the previous value, or always `None` when the
    /// view was acquired with `putReturnsNull`.
    pub async fn put(&self, key: Value, value: Value) -> Result<Option<Value>> {
        self.check_key(&key)?;
        self.check_value(&value)?;
        if self.ctx.put_returns_null() {
            self.store.put(key, value).await?;
            Ok(None)
        } else {
            self.store.get_and_put(key, value).await
        }
    }

    pub async fn put_all(&self, entries: Vec<(Value, Value)>) -> Result<()> {
        for (key, value) in &entries {
            self.check_key(key)?;
            self.check_value(value)?;
        }
        self.store.put_all(entries).await
    }

    /// Remove a key. Returns the removed value, or always `None` when the
    /// view was acquired with `removeReturnsNull`.
    pub async fn remove(&self, key: &Value) -> Result<Option<Value>> {
        self.check_key(key)?;
        if self.ctx.remove_returns_null() {
            self.store.remove(key).await?;
            Ok(None)
        } else {
            self.store.get_and_remove(key).await
        }
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    pub async fn size(&self) -> Result<u64> {
        self.store.size().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.size().await? == 0)
    }

    pub async fn replace(&self, key: Value, value: Value) -> Result<Option<Value>> {
        self.check_key(&key)?;
        self.check_value(&value)?;
        self.store.replace(key, value).await
    }

    pub async fn replace_if_equal(&self, key: Value, old: Value, new: Value) -> Result<bool> {
        self.check_key(&key)?;
        self.check_value(&old)?;
        self.check_value(&new)?;
        self.store.replace_if_equal(key, old, new).await
    }

    pub async fn put_if_absent(&self, key: Value, value: Value) -> Result<Option<Value>> {
        self.check_key(&key)?;
        self.check_value(&value)?;
        self.store.put_if_absent(key, value).await
    }

    pub async fn remove_if_equal(&self, key: Value, value: Value) -> Result<bool> {
        self.check_key(&key)?;
        self.check_value(&value)?;
        self.store.remove_if_equal(key, value).await
    }

    /// Recompute a key's value with the named key function. A `None` result
    /// removes the key.
    pub async fn compute(&self, key: Value, function: &str) -> Result<Option<Value>> {
        self.check_key(&key)?;
        let result = self
            .store
            .apply_to(
                &MapFunction::Compute(function.to_string()),
                Value::Array(vec![key]),
            )
            .await?;
        Ok(result.into_option())
    }

    pub async fn compute_if_absent(&self, key: Value, function: &str) -> Result<Option<Value>> {
        self.check_key(&key)?;
        let result = self
            .store
            .apply_to(
                &MapFunction::ComputeIfAbsent(function.to_string()),
                Value::Array(vec![key]),
            )
            .await?;
        Ok(result.into_option())
    }

    pub async fn compute_if_present(&self, key: Value, function: &str) -> Result<Option<Value>> {
        self.check_key(&key)?;
        let result = self
            .store
            .apply_to(
                &MapFunction::ComputeIfPresent(function.to_string()),
                Value::Array(vec![key]),
            )
            .await?;
        Ok(result.into_option())
    }

    /// Store `value` if the key is absent, otherwise combine it with the
    /// current value using the named key function.
    pub async fn merge(&self, key: Value, value: Value, function: &str) -> Result<Option<Value>> {
        self.check_key(&key)?;
        self.check_value(&value)?;
        let result = self
            .store
            .apply_to(
                &MapFunction::Merge(function.to_string()),
                Value::Array(vec![key, value]),
            )
            .await?;
        Ok(result.into_option())
    }

    pub async fn key_set(&self) -> Result<Arc<dyn CollectionView>> {
        self.collection(CollectionKind::KeySet).await
    }

    pub async fn values(&self) -> Result<Arc<dyn CollectionView>> {
        self.collection(CollectionKind::Values).await
    }

    pub async fn entry_set(&self) -> Result<Arc<dyn CollectionView>> {
        self.collection(CollectionKind::EntrySet).await
    }

    async fn collection(&self, kind: CollectionKind) -> Result<Arc<dyn CollectionView>> {
        match self.store.collection(kind).await? {
            Some(view) => Ok(view),
            None => Ok(Arc::new(MapCollection::new(kind, self.store.clone()))),
        }
    }

    pub async fn hash_code(&self) -> Result<i64> {
        self.store.hash_code().await
    }

    pub async fn apply_to(&self, function: &MapFunction, arg: Value) -> Result<Value> {
        self.store.apply_to(function, arg).await
    }

    pub async fn async_update(&self, function: &MapFunction, arg: Value) -> Result<()> {
        self.store.async_update(function, arg).await
    }

    pub async fn sync_update(
        &self,
        update: &MapFunction,
        update_arg: Value,
        returning: &MapFunction,
        returning_arg: Value,
    ) -> Result<Value> {
        self.store
            .sync_update(update, update_arg, returning, returning_arg)
            .await
    }

    pub async fn entries(&self) -> Result<Vec<(Value, Value)>> {
        self.store.entries().await
    }

    /// Compare contents with another map.
    ///
    /// Pulls both entry sets, so this is O(n) and, for remote maps,
    /// network-bound.
    pub async fn content_equals(&self, other: &MapView) -> Result<bool> {
        if self.size().await? != other.size().await? {
            return Ok(false);
        }
        let mine: BTreeMap<Value, Value> = self.entries().await?.into_iter().collect();
        let theirs: BTreeMap<Value, Value> = other.entries().await?.into_iter().collect();
        Ok(mine == theirs)
    }

    /// Subscribe to this map's events.
    pub async fn register_subscriber(
        &self,
        bootstrap: bool,
        end_after_bootstrap: bool,
    ) -> Result<Subscriber<MapEvent>> {
        let asset = self
            .asset
            .upgrade()
            .ok_or_else(|| Error::not_found(format!("node {} was torn down", self.ctx.path())))?;
        let subscription = asset
            .acquire_view(&self.ctx.for_view(ViewType::Subscription))?
            .into_subscription()?;
        subscription
            .register_subscriber(SubscriptionOptions {
                bootstrap,
                end_after_bootstrap,
                null_old_value_on_update: self.ctx.null_old_value_on_update_event(),
            })
            .await
    }
}

impl std::fmt::Debug for MapView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapView")
            .field("uri", &self.ctx.to_uri())
            .finish_non_exhaustive()
    }
}
