use async_trait::async_trait;
use kvtree_core_store::{CollectionKind, CollectionView, Error, Result, Value};
use kvtree_wire::{CollectionOp, Connection, Handle};

/// A key set, value collection or entry set held by the server and
/// addressed through a connection-scoped handle.
///
/// Elements are pulled a segment at a time when iterated. The handle is
/// only valid on the connection that obtained it.
pub struct RemoteCollection {
    connection: Connection,
    handle: Handle,
    kind: CollectionKind,
}

impl RemoteCollection {
    pub fn new(connection: Connection, handle: Handle, kind: CollectionKind) -> Self {
        Self {
            connection,
            handle,
            kind,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// A handle dies with its connection, so a closed connection is
    /// reported as an invalid handle.
    async fn call(&self, op: CollectionOp, params: Vec<Value>) -> Result<Value> {
        let Handle { csp, cid } = &self.handle;
        match self.connection.call(csp, Some(*cid), op.as_str(), params).await {
            Ok(body) => body.into_value(),
            Err(Error::ConnectionClosed) => Err(Error::InvalidHandle {
                csp: csp.clone(),
                cid: *cid,
            }),
            Err(e) => Err(e),
        }
    }

    async fn call_bool(&self, op: CollectionOp, params: Vec<Value>) -> Result<bool> {
        let reply = self.call(op, params).await?;
        reply
            .as_bool()
            .ok_or_else(|| Error::protocol(format!("{} replied {}, expected a bool", op, reply)))
    }
}

#[async_trait]
impl CollectionView for RemoteCollection {
    fn kind(&self) -> CollectionKind {
        self.kind
    }

    async fn size(&self) -> Result<u64> {
        let size = self.call(CollectionOp::Size, vec![]).await?;
        size.as_i64()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| Error::protocol(format!("size replied {}", size)))
    }

    async fn is_empty(&self) -> Result<bool> {
        self.call_bool(CollectionOp::IsEmpty, vec![]).await
    }

    async fn contains(&self, element: &Value) -> Result<bool> {
        self.call_bool(CollectionOp::Contains, vec![element.clone()])
            .await
    }

    async fn contains_all(&self, elements: &[Value]) -> Result<bool> {
        self.call_bool(CollectionOp::ContainsAll, vec![Value::from(elements.to_vec())])
            .await
    }

    async fn add(&self, element: Value) -> Result<bool> {
        self.call_bool(CollectionOp::Add, vec![element]).await
    }

    async fn add_all(&self, elements: Vec<Value>) -> Result<bool> {
        self.call_bool(CollectionOp::AddAll, vec![Value::from(elements)])
            .await
    }

    async fn remove(&self, element: &Value) -> Result<bool> {
        self.call_bool(CollectionOp::Remove, vec![element.clone()])
            .await
    }

    async fn remove_all(&self, elements: &[Value]) -> Result<bool> {
        self.call_bool(CollectionOp::RemoveAll, vec![Value::from(elements.to_vec())])
            .await
    }

    async fn retain_all(&self, elements: &[Value]) -> Result<bool> {
        self.call_bool(CollectionOp::RetainAll, vec![Value::from(elements.to_vec())])
            .await
    }

    async fn clear(&self) -> Result<()> {
        self.call(CollectionOp::Clear, vec![]).await.map(|_| ())
    }

    async fn number_of_segments(&self) -> Result<u32> {
        let segments = self.call(CollectionOp::NumberOfSegments, vec![]).await?;
        segments
            .as_i64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| Error::protocol(format!("numberOfSegments replied {}", segments)))
    }

    async fn iterator(&self, segment: u32) -> Result<Vec<Value>> {
        self.call(CollectionOp::Iterator, vec![Value::Integer(i64::from(segment))])
            .await?
            .into_array()
            .ok_or_else(|| Error::protocol("iterator reply is not an array"))
    }
}

impl std::fmt::Debug for RemoteCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCollection")
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .finish()
    }
}
