//! Collection views built over a store.
//!
//! Used whenever the store does not supply its own collection (see
//! [`KeyValueStore::collection`]). Every operation is translated into store
//! operations, so the same view works over a local store and over a remote
//! proxy.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{CollectionKind, CollectionView, Error, KeyValueStore, Result, Value};

/// Elements per iterator segment of a store-backed collection.
pub const SEGMENT_SIZE: usize = 64;

/// Segments needed for `size` elements. An empty collection still has one,
/// empty, segment.
pub fn segments_for(size: u64) -> u32 {
    let segments = size.div_ceil(SEGMENT_SIZE as u64).max(1);
    u32::try_from(segments).unwrap_or(u32::MAX)
}

/// A key set, value collection or entry set backed by a store.
#[derive(Clone)]
pub struct MapCollection {
    kind: CollectionKind,
    store: Arc<dyn KeyValueStore>,
}

impl MapCollection {
    pub fn new(kind: CollectionKind, store: Arc<dyn KeyValueStore>) -> Self {
        Self { kind, store }
    }

    fn element(&self, key: Value, value: Value) -> Value {
        match self.kind {
            CollectionKind::KeySet => key,
            CollectionKind::Values => value,
            CollectionKind::EntrySet => Value::entry(key, value),
        }
    }

    fn split_entry(element: &Value) -> Result<(Value, Value)> {
        element.clone().into_entry().ok_or_else(|| {
            Error::invalid_argument(format!("not a [key, value] entry: {}", element))
        })
    }
}

impl std::fmt::Debug for MapCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapCollection")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CollectionView for MapCollection {
    fn kind(&self) -> CollectionKind {
        self.kind
    }

    async fn size(&self) -> Result<u64> {
        self.store.size().await
    }

    async fn contains(&self, element: &Value) -> Result<bool> {
        match self.kind {
            CollectionKind::KeySet => self.store.contains_key(element).await,
            CollectionKind::Values => self.store.contains_value(element).await,
            CollectionKind::EntrySet => {
                let (key, value) = Self::split_entry(element)?;
                Ok(self.store.get(&key).await? == Some(value))
            }
        }
    }

    async fn remove(&self, element: &Value) -> Result<bool> {
        match self.kind {
            CollectionKind::KeySet => Ok(self.store.get_and_remove(element).await?.is_some()),
            CollectionKind::Values => {
                let found = self
                    .store
                    .entries()
                    .await?
                    .into_iter()
                    .find(|(_, value)| value == element);
                match found {
                    Some((key, value)) => self.store.remove_if_equal(key, value).await,
                    None => Ok(false),
                }
            }
            CollectionKind::EntrySet => {
                let (key, value) = Self::split_entry(element)?;
                self.store.remove_if_equal(key, value).await
            }
        }
    }

    async fn retain_all(&self, elements: &[Value]) -> Result<bool> {
        let keep: BTreeSet<&Value> = elements.iter().collect();
        let mut changed = false;
        for (key, value) in self.store.entries().await? {
            let element = self.element(key.clone(), value.clone());
            if !keep.contains(&element) {
                changed |= self.store.remove_if_equal(key, value).await?;
            }
        }
        Ok(changed)
    }

    async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    async fn number_of_segments(&self) -> Result<u32> {
        Ok(segments_for(self.store.size().await?))
    }

    /// Entries are read in key order, so segments are stable while the
    /// map is not modified.
    async fn iterator(&self, segment: u32) -> Result<Vec<Value>> {
        let entries = self.store.entries().await?;
        let segments = segments_for(entries.len() as u64);
        if segment >= segments {
            return Err(Error::invalid_argument(format!(
                "segment {} out of range, collection has {} segments",
                segment, segments
            )));
        }
        Ok(entries
            .into_iter()
            .skip(segment as usize * SEGMENT_SIZE)
            .take(SEGMENT_SIZE)
            .map(|(key, value)| self.element(key, value))
            .collect())
    }
}
