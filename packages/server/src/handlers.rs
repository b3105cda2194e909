//! Handler tables for map and collection-handle requests.
//!
//! Every op code maps to exactly one handler through an exhaustive match,
//! so adding an op code without a handler does not compile.

use std::sync::Arc;

use futures::future::BoxFuture;
use kvtree_core_store::{
    AssetTree, CollectionKind, CollectionView, Error, KeyValueStore, MapFunction, RequestContext,
    Result, Value,
};
use kvtree_wire::{param, Body, CollectionOp, Handle, MapOp};
use parking_lot::Mutex;

use crate::handles::HandleRegistry;

/// A request addressed to a map or store.
pub(crate) struct MapRequest {
    pub(crate) tree: Arc<AssetTree>,
    pub(crate) handles: Arc<Mutex<HandleRegistry>>,
    pub(crate) ctx: RequestContext,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) params: Vec<Value>,
}

impl MapRequest {
    fn arg(&self, index: usize, name: &str) -> Result<Value> {
        param(&self.params, index, name)
    }
}

pub(crate) type MapHandler = fn(MapRequest) -> BoxFuture<'static, Result<Body>>;

pub(crate) fn map_handler(op: MapOp) -> MapHandler {
    match op {
        MapOp::Size => size,
        MapOp::ContainsKey => contains_key,
        MapOp::ContainsValue => contains_value,
        MapOp::Get => get,
        MapOp::GetAndPut => get_and_put,
        MapOp::Put => put,
        MapOp::GetAndRemove => get_and_remove,
        MapOp::Remove => remove,
        MapOp::Clear => clear,
        MapOp::KeySet => key_set,
        MapOp::Values => values,
        MapOp::EntrySet => entry_set,
        MapOp::Replace => replace,
        MapOp::ReplaceIfEqual => replace_if_equal,
        MapOp::PutIfAbsent => put_if_absent,
        MapOp::RemoveIfEqual => remove_if_equal,
        MapOp::PutAll => put_all,
        MapOp::HashCode => hash_code,
        MapOp::ApplyTo => apply_to,
        MapOp::AsyncUpdate => async_update,
        MapOp::SyncUpdate => sync_update,
    }
}

fn reply(value: impl Into<Value>) -> Body {
    Body::Reply(value.into())
}

fn reply_option(value: Option<Value>) -> Body {
    Body::Reply(Value::from_option(value))
}

fn count(n: u64) -> Value {
    Value::Integer(n as i64)
}

fn size(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move { Ok(reply(count(req.store.size().await?))) })
}

fn contains_key(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let key = req.arg(0, "key")?;
        Ok(reply(req.store.contains_key(&key).await?))
    })
}

fn contains_value(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let value = req.arg(0, "value")?;
        Ok(reply(req.store.contains_value(&value).await?))
    })
}

fn get(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let key = req.arg(0, "key")?;
        Ok(reply_option(req.store.get(&key).await?))
    })
}

fn get_and_put(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let (key, value) = (req.arg(0, "key")?, req.arg(1, "value")?);
        Ok(reply_option(req.store.get_and_put(key, value).await?))
    })
}

fn put(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let (key, value) = (req.arg(0, "key")?, req.arg(1, "value")?);
        req.store.put(key, value).await?;
        Ok(Body::Empty)
    })
}

fn get_and_remove(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let key = req.arg(0, "key")?;
        Ok(reply_option(req.store.get_and_remove(&key).await?))
    })
}

fn remove(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let key = req.arg(0, "key")?;
        req.store.remove(&key).await?;
        Ok(Body::Empty)
    })
}

fn clear(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        req.store.clear().await?;
        Ok(Body::Empty)
    })
}

/// Register a handle for a collection view of the request's map. The
/// handle's csp carries the map's key and value types.
async fn collection_handle(req: MapRequest, kind: CollectionKind) -> Result<Body> {
    let mut ctx = RequestContext::new(req.ctx.path().clone());
    ctx.set_view_type(kind.view_type())?
        .set_key_type(req.ctx.key_type())?
        .set_value_type(req.ctx.value_type())?;
    let csp = ctx.to_uri();
    let view = req.tree.acquire_collection(&csp)?;
    let cid = req.handles.lock().register(csp.clone(), view);
    tracing::debug!(%csp, cid, "issued handle");
    Ok(Handle { csp, cid }.to_body())
}

fn key_set(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(collection_handle(req, CollectionKind::KeySet))
}

fn values(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(collection_handle(req, CollectionKind::Values))
}

fn entry_set(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(collection_handle(req, CollectionKind::EntrySet))
}

fn replace(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let (key, value) = (req.arg(0, "key")?, req.arg(1, "value")?);
        Ok(reply_option(req.store.replace(key, value).await?))
    })
}

fn replace_if_equal(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let key = req.arg(0, "key")?;
        let old = req.arg(1, "oldValue")?;
        let new = req.arg(2, "newValue")?;
        Ok(reply(req.store.replace_if_equal(key, old, new).await?))
    })
}

fn put_if_absent(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let (key, value) = (req.arg(0, "key")?, req.arg(1, "value")?);
        Ok(reply_option(req.store.put_if_absent(key, value).await?))
    })
}

fn remove_if_equal(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let (key, value) = (req.arg(0, "key")?, req.arg(1, "value")?);
        Ok(reply(req.store.remove_if_equal(key, value).await?))
    })
}

fn put_all(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let entries = req
            .arg(0, "entries")?
            .into_array()
            .ok_or_else(|| Error::protocol("putAll expects an array of entries"))?
            .into_iter()
            .map(|entry| {
                entry
                    .into_entry()
                    .ok_or_else(|| Error::protocol("putAll entry is not a [key, value] pair"))
            })
            .collect::<Result<Vec<_>>>()?;
        req.store.put_all(entries).await?;
        Ok(Body::Empty)
    })
}

fn hash_code(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move { Ok(reply(req.store.hash_code().await?)) })
}

fn function_arg(req: &MapRequest, index: usize) -> Result<MapFunction> {
    MapFunction::from_value(req.arg(index, "function")?)
}

fn apply_to(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let function = function_arg(&req, 0)?;
        let arg = req.arg(1, "arg")?;
        Ok(reply(req.store.apply_to(&function, arg).await?))
    })
}

fn async_update(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let function = function_arg(&req, 0)?;
        let arg = req.arg(1, "arg")?;
        req.store.async_update(&function, arg).await?;
        Ok(Body::Empty)
    })
}

fn sync_update(req: MapRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let update = function_arg(&req, 0)?;
        let update_arg = req.arg(1, "updateArg")?;
        let returning = function_arg(&req, 2)?;
        let returning_arg = req.arg(3, "returnArg")?;
        let result = req
            .store
            .sync_update(&update, update_arg, &returning, returning_arg)
            .await?;
        Ok(reply(result))
    })
}

/// A request addressed to a collection handle.
pub(crate) struct CollectionRequest {
    pub(crate) view: Arc<dyn CollectionView>,
    pub(crate) params: Vec<Value>,
}

impl CollectionRequest {
    fn arg(&self, index: usize, name: &str) -> Result<Value> {
        param(&self.params, index, name)
    }

    fn elements(&self) -> Result<Vec<Value>> {
        self.arg(0, "elements")?
            .into_array()
            .ok_or_else(|| Error::protocol("expected an array of elements"))
    }
}

pub(crate) type CollectionHandler = fn(CollectionRequest) -> BoxFuture<'static, Result<Body>>;

pub(crate) fn collection_handler(op: CollectionOp) -> CollectionHandler {
    match op {
        CollectionOp::Size => collection_size,
        CollectionOp::IsEmpty => is_empty,
        CollectionOp::Add => add,
        CollectionOp::AddAll => add_all,
        CollectionOp::RetainAll => retain_all,
        CollectionOp::ContainsAll => contains_all,
        CollectionOp::RemoveAll => remove_all,
        CollectionOp::Clear => collection_clear,
        CollectionOp::Remove => collection_remove,
        CollectionOp::Contains => contains,
        CollectionOp::Iterator => iterator,
        CollectionOp::NumberOfSegments => number_of_segments,
    }
}

fn collection_size(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move { Ok(reply(count(req.view.size().await?))) })
}

fn is_empty(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move { Ok(reply(req.view.is_empty().await?)) })
}

fn add(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let element = req.arg(0, "element")?;
        Ok(reply(req.view.add(element).await?))
    })
}

fn add_all(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let elements = req.elements()?;
        Ok(reply(req.view.add_all(elements).await?))
    })
}

fn retain_all(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let elements = req.elements()?;
        Ok(reply(req.view.retain_all(&elements).await?))
    })
}

fn contains_all(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let elements = req.elements()?;
        Ok(reply(req.view.contains_all(&elements).await?))
    })
}

fn remove_all(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let elements = req.elements()?;
        Ok(reply(req.view.remove_all(&elements).await?))
    })
}

fn collection_clear(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        req.view.clear().await?;
        Ok(Body::Empty)
    })
}

fn collection_remove(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let element = req.arg(0, "element")?;
        Ok(reply(req.view.remove(&element).await?))
    })
}

fn contains(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let element = req.arg(0, "element")?;
        Ok(reply(req.view.contains(&element).await?))
    })
}

fn iterator(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let segment = req
            .arg(0, "segment")?
            .as_i64()
            .and_then(|s| u32::try_from(s).ok())
            .ok_or_else(|| Error::protocol("segment must be a non-negative integer"))?;
        Ok(reply(Value::Array(req.view.iterator(segment).await?)))
    })
}

fn number_of_segments(req: CollectionRequest) -> BoxFuture<'static, Result<Body>> {
    Box::pin(async move {
        let segments = req.view.number_of_segments().await?;
        Ok(reply(Value::Integer(i64::from(segments))))
    })
}
