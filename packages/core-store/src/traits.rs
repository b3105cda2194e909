//! The store contract and the capabilities layered on it.
//!
//! Every capability a resource node can expose, apart from the map and
//! reference wrappers, is a trait object: a [`KeyValueStore`] may be the
//! in-memory leaf or a proxy to a remote host, a [`Subscription`] may be the
//! local hub or a remote one. Everything above these traits works the same
//! in both cases.
//!
//! The traits are async so that remote implementations await their replies
//! instead of blocking a runtime thread.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::{
    EngineReplication, Error, MapEvent, MapFunction, Result, Subscriber, SubscriberId,
    SubscriptionOptions, Value, ViewType,
};

/// The key-value store contract.
///
/// Keys and values are never [`Value::Null`]; implementations reject null
/// with [`Error::InvalidArgument`] before doing any work.
///
/// Compound operations have default implementations that go through
/// [`KeyValueStore::apply_to`], so an implementation that evaluates
/// [`MapFunction`]s atomically gets atomic compound operations for free.
///
/// # Object Safety
///
/// This trait is object-safe; the tree holds stores as
/// `Arc<dyn KeyValueStore>`.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &Value) -> Result<Option<Value>>;

    async fn contains_key(&self, key: &Value) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn contains_value(&self, value: &Value) -> Result<bool> {
        let found = self
            .apply_to(&MapFunction::ContainsValue, value.clone())
            .await?;
        Ok(found.as_bool().unwrap_or(false))
    }

    /// Store a value without returning the previous one. Remote
    /// implementations do not wait for a reply.
    async fn put(&self, key: Value, value: Value) -> Result<()>;

    /// Store a value and return the previous one.
    async fn get_and_put(&self, key: Value, value: Value) -> Result<Option<Value>>;

    /// Remove a key without returning the previous value.
    async fn remove(&self, key: &Value) -> Result<()>;

    async fn get_and_remove(&self, key: &Value) -> Result<Option<Value>>;

    async fn size(&self) -> Result<u64>;

    async fn clear(&self) -> Result<()>;

    async fn put_all(&self, entries: Vec<(Value, Value)>) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value).await?;
        }
        Ok(())
    }

    /// Every live entry, in key order.
    async fn entries(&self) -> Result<Vec<(Value, Value)>> {
        let view = self
            .collection(CollectionKind::EntrySet)
            .await?
            .ok_or_else(|| Error::unsupported("entries"))?;
        view.to_vec()
            .await?
            .into_iter()
            .map(|element| {
                element
                    .into_entry()
                    .ok_or_else(|| Error::protocol("entry set element is not a [key, value] pair"))
            })
            .collect()
    }

    /// Evaluate a function atomically against the store and return its
    /// result.
    async fn apply_to(&self, function: &MapFunction, arg: Value) -> Result<Value>;

    /// Evaluate a function for its side effects only.
    async fn async_update(&self, function: &MapFunction, arg: Value) -> Result<()> {
        self.apply_to(function, arg).await.map(|_| ())
    }

    /// Apply an update function, then evaluate a second function and
    /// return its result.
    async fn sync_update(
        &self,
        update: &MapFunction,
        update_arg: Value,
        returning: &MapFunction,
        returning_arg: Value,
    ) -> Result<Value> {
        self.apply_to(update, update_arg).await?;
        self.apply_to(returning, returning_arg).await
    }

    /// Store `value` unless the key is present. Returns the present value.
    async fn put_if_absent(&self, key: Value, value: Value) -> Result<Option<Value>> {
        let previous = self
            .apply_to(&MapFunction::PutIfAbsent, Value::Array(vec![key, value]))
            .await?;
        Ok(previous.into_option())
    }

    /// Store `value` only if the key is present. Returns the replaced value.
    async fn replace(&self, key: Value, value: Value) -> Result<Option<Value>> {
        let previous = self
            .apply_to(&MapFunction::Replace, Value::Array(vec![key, value]))
            .await?;
        Ok(previous.into_option())
    }

    async fn replace_if_equal(&self, key: Value, old: Value, new: Value) -> Result<bool> {
        let replaced = self
            .apply_to(&MapFunction::ReplaceIfEqual, Value::Array(vec![key, old, new]))
            .await?;
        Ok(replaced.as_bool().unwrap_or(false))
    }

    async fn remove_if_equal(&self, key: Value, value: Value) -> Result<bool> {
        let removed = self
            .apply_to(&MapFunction::RemoveIfEqual, Value::Array(vec![key, value]))
            .await?;
        Ok(removed.as_bool().unwrap_or(false))
    }

    /// Order-independent hash of the contents.
    async fn hash_code(&self) -> Result<i64> {
        let hash = self.apply_to(&MapFunction::HashCode, Value::Null).await?;
        hash.as_i64()
            .ok_or_else(|| Error::protocol(format!("hashCode returned {}", hash)))
    }

    /// A store-provided collection view, if the store has its own.
    /// Remote stores return a handle-backed view; local stores return
    /// `None` and let the map build one over the store.
    async fn collection(&self, _kind: CollectionKind) -> Result<Option<Arc<dyn CollectionView>>> {
        Ok(None)
    }

    /// The replication capability of this store, if it has one.
    fn as_replication(self: Arc<Self>) -> Option<Arc<dyn EngineReplication>> {
        None
    }
}

/// Which bulk view of a map a [`CollectionView`] is.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CollectionKind {
    KeySet,
    Values,
    EntrySet,
}

impl CollectionKind {
    pub fn view_type(&self) -> ViewType {
        match self {
            CollectionKind::KeySet => ViewType::KeySet,
            CollectionKind::Values => ViewType::Values,
            CollectionKind::EntrySet => ViewType::EntrySet,
        }
    }

    pub fn from_view_type(view: ViewType) -> Option<Self> {
        match view {
            ViewType::KeySet => Some(CollectionKind::KeySet),
            ViewType::Values => Some(CollectionKind::Values),
            ViewType::EntrySet => Some(CollectionKind::EntrySet),
            _ => None,
        }
    }
}

/// A live collection over a map: its keys, its values or its entries.
///
/// Entry-set elements are `[key, value]` pairs (see [`Value::entry`]).
/// Removing through the view removes from the underlying map. Adding is not
/// supported by map-backed views.
#[async_trait]
pub trait CollectionView: Send + Sync {
    fn kind(&self) -> CollectionKind;

    async fn size(&self) -> Result<u64>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.size().await? == 0)
    }

    async fn contains(&self, element: &Value) -> Result<bool>;

    async fn contains_all(&self, elements: &[Value]) -> Result<bool> {
        for element in elements {
            if !self.contains(element).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn add(&self, _element: Value) -> Result<bool> {
        Err(Error::unsupported(format!("add to {:?}", self.kind())))
    }

    async fn add_all(&self, _elements: Vec<Value>) -> Result<bool> {
        Err(Error::unsupported(format!("addAll to {:?}", self.kind())))
    }

    /// Remove one element. Returns whether the map changed.
    async fn remove(&self, element: &Value) -> Result<bool>;

    async fn remove_all(&self, elements: &[Value]) -> Result<bool> {
        let mut changed = false;
        for element in elements {
            changed |= self.remove(element).await?;
        }
        Ok(changed)
    }

    /// Keep only the given elements. Returns whether the map changed.
    async fn retain_all(&self, elements: &[Value]) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    async fn number_of_segments(&self) -> Result<u32> {
        Ok(1)
    }

    /// The elements of one segment.
    async fn iterator(&self, segment: u32) -> Result<Vec<Value>>;

    /// Every element, segment by segment.
    async fn to_vec(&self) -> Result<Vec<Value>> {
        let mut elements = Vec::new();
        for segment in 0..self.number_of_segments().await? {
            elements.extend(self.iterator(segment).await?);
        }
        Ok(elements)
    }
}

/// A source of map events.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Register a subscriber. With `bootstrap` set the subscriber first
    /// receives the current contents as insert events, with no gap between
    /// them and the live events that follow.
    async fn register_subscriber(&self, options: SubscriptionOptions)
        -> Result<Subscriber<MapEvent>>;

    /// End a subscriber. It receives the end-of-subscription sentinel.
    async fn unregister_subscriber(&self, id: SubscriberId) -> Result<()>;

    fn subscriber_count(&self) -> usize;

    /// Deliver an event to every subscriber. Only meaningful for local
    /// subscriptions; remote ones receive their events from the wire.
    fn publish(&self, _event: MapEvent) {}

    /// Connect the store whose contents bootstrap new subscribers.
    fn attach_source(&self, _source: Weak<dyn SnapshotSource>) {}

    /// End every subscriber and refuse new ones.
    fn close(&self);
}

/// Supplies a consistent snapshot for subscription bootstrap.
pub trait SnapshotSource: Send + Sync {
    /// Call `f` with the current entries while holding the store's write
    /// lock, so no mutation can slip in between the snapshot and whatever
    /// `f` registers.
    fn with_snapshot(&self, f: &mut dyn FnMut(Vec<(Value, Value)>));
}

/// Reject a null key or value.
pub fn require_non_null(value: &Value, role: &str) -> Result<()> {
    if value.is_null() {
        Err(Error::invalid_argument(format!("{} can not be null", role)))
    } else {
        Ok(())
    }
}
