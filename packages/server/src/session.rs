//! One served connection.
//!
//! A session reads documents in order and hands each one to a dispatch
//! task, so a slow request never holds up the reader or requests for other
//! paths. Requests for the same path queue behind each other and run in
//! arrival order: a fire-and-forget write is visible to every later request
//! on that path. Subscription forwarders and replication deliveries run as
//! their own tasks and share the session's writer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use kvtree_core_store::{
    AssetTree, Bootstrap, Delivery, EngineReplication, Error, ErrorKind, HostId, MapEvent,
    RequestContext, Result, Subscriber, SubscriberId, TopologyEvent, Value, ViewType,
};
use kvtree_replication::{apply_event, begin_streaming, bootstrap_body, deliver};
use kvtree_wire::frame::read_document;
use kvtree_wire::{
    param, Body, CollectionOp, Document, FrameWriter, Header, MapOp, ReplicationOp,
    SubscriptionOp, WireCodec,
};
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::handlers::{collection_handler, map_handler, CollectionRequest, MapRequest};
use crate::handles::HandleRegistry;

type Subscriptions = Arc<Mutex<HashMap<i64, (String, SubscriberId)>>>;

/// Replication streams are keyed by the replicated path and the peer.
type LinkKey = (String, HostId);

pub(crate) struct Session {
    tree: Arc<AssetTree>,
    writer: FrameWriter,
    peer: String,
    handles: Arc<Mutex<HandleRegistry>>,
    subscriptions: Subscriptions,
    forwarders: Mutex<HashMap<i64, JoinHandle<()>>>,
    /// The `replicationSubscribe` tid each peer listens on.
    links: Mutex<HashMap<LinkKey, i64>>,
    deliveries: Mutex<HashMap<LinkKey, JoinHandle<()>>>,
    /// Requests waiting for their path's dispatch task. A path has an entry
    /// exactly while a task is draining it.
    queues: Mutex<HashMap<String, VecDeque<Document>>>,
    dispatchers: Mutex<JoinSet<()>>,
}

impl Session {
    pub(crate) fn new(tree: Arc<AssetTree>, writer: FrameWriter, peer: String) -> Arc<Self> {
        Arc::new(Self {
            tree,
            writer,
            peer,
            handles: Arc::new(Mutex::new(HandleRegistry::default())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            forwarders: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            dispatchers: Mutex::new(JoinSet::new()),
        })
    }

    /// Read and dispatch until the peer hangs up, the stream breaks or
    /// `shutdown` flips to true.
    pub(crate) async fn serve<R>(
        self: Arc<Self>,
        mut read: R,
        codec: Arc<dyn WireCodec>,
        max_frame: usize,
        mut shutdown: watch::Receiver<bool>,
    ) where
        R: AsyncRead + Unpin,
    {
        tracing::debug!(peer = %self.peer, codec = codec.name(), "session started");
        loop {
            let next = tokio::select! {
                next = read_document(&mut read, codec.as_ref(), max_frame) => next,
                _ = stopped(&mut shutdown) => break,
            };
            match next {
                Ok(Some(document)) => self.enqueue(document),
                Ok(None) => break,
                Err(e @ Error::Codec { .. }) => {
                    // the frame was consumed whole, so the stream is still aligned
                    tracing::warn!(peer = %self.peer, error = %e, "dropping undecodable frame");
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer, error = %e, "read failed");
                    break;
                }
            }
        }
        self.settle(&mut shutdown).await;
        self.close().await;
    }

    /// Queue a request behind earlier requests for the same path, starting
    /// a dispatch task for the path if none is running.
    fn enqueue(self: &Arc<Self>, document: Document) {
        let key = queue_key(&document.header);
        {
            let mut queues = self.queues.lock();
            if let Some(pending) = queues.get_mut(&key) {
                pending.push_back(document);
                return;
            }
            queues.insert(key.clone(), VecDeque::from([document]));
        }
        let mut dispatchers = self.dispatchers.lock();
        while dispatchers.try_join_next().is_some() {}
        dispatchers.spawn(self.clone().drain(key));
    }

    /// Dispatch the requests queued for one path, oldest first, and exit
    /// once the queue is empty.
    async fn drain(self: Arc<Self>, key: String) {
        loop {
            let next = {
                let mut queues = self.queues.lock();
                match queues.get_mut(&key).and_then(VecDeque::pop_front) {
                    Some(document) => document,
                    None => {
                        queues.remove(&key);
                        return;
                    }
                }
            };
            self.dispatch(next).await;
        }
    }

    /// Let requests already read finish, unless the server is stopping.
    async fn settle(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut dispatchers = std::mem::take(&mut *self.dispatchers.lock());
        tokio::select! {
            _ = async { while dispatchers.join_next().await.is_some() {} } => {}
            _ = stopped(shutdown) => {
                tracing::debug!(peer = %self.peer, "abandoning queued requests");
            }
        }
        dispatchers.abort_all();
        self.queues.lock().clear();
    }

    async fn dispatch(self: &Arc<Self>, document: Document) {
        let Document { header, body } = document;
        let (name, params) = match body {
            Body::Event { name, params } => (name, params),
            other => {
                tracing::debug!(
                    peer = %self.peer,
                    tid = header.tid,
                    ?other,
                    "ignoring non-request"
                );
                return;
            }
        };

        match self.handle(&header, &name, params).await {
            Ok(Some(body)) => self.reply(header.tid, body).await,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    peer = %self.peer,
                    tid = header.tid,
                    csp = ?header.csp,
                    event = %name,
                    error = %e,
                    "request failed"
                );
                if owes_reply(&header, &name) {
                    self.reply(header.tid, Body::exception(&e)).await;
                }
            }
        }
    }

    /// Write a reply. A reply the writer refuses, such as one over the
    /// frame limit, is replaced by an exception so the caller is answered.
    async fn reply(&self, tid: i64, body: Body) {
        let document = Document::new(Header::new(tid), body);
        let e = match self.writer.write(&document).await {
            Ok(()) => return,
            Err(e) => e,
        };
        tracing::warn!(peer = %self.peer, tid, error = %e, "could not write reply");
        if e.kind() == ErrorKind::Io {
            return;
        }
        let fallback = Document::new(Header::new(tid), Body::exception(&e));
        if let Err(e) = self.writer.write(&fallback).await {
            tracing::warn!(peer = %self.peer, tid, error = %e, "could not write error reply");
        }
    }

    /// Handle one request. `None` means no reply is sent.
    async fn handle(
        self: &Arc<Self>,
        header: &Header,
        name: &str,
        params: Vec<Value>,
    ) -> Result<Option<Body>> {
        let csp = header
            .csp
            .as_deref()
            .ok_or_else(|| Error::protocol("request without a csp"))?;

        if let Some(cid) = header.cid {
            let op: CollectionOp = name.parse()?;
            let view = self.handles.lock().get(cid, csp)?;
            let handler = collection_handler(op);
            return handler(CollectionRequest { view, params }).await.map(Some);
        }
        if let Ok(op) = name.parse::<ReplicationOp>() {
            return self.replication(op, csp, header.tid, params).await;
        }
        if let Ok(op) = name.parse::<SubscriptionOp>() {
            return self.subscription(op, csp, header.tid, params).await;
        }

        let op: MapOp = name.parse()?;
        let ctx = RequestContext::parse(csp)?;
        let store = self
            .tree
            .acquire_view(&ctx.for_view(ViewType::Store))?
            .into_store()?;
        let handler = map_handler(op);
        let body = handler(MapRequest {
            tree: self.tree.clone(),
            handles: self.handles.clone(),
            ctx,
            store,
            params,
        })
        .await?;
        Ok((!op.is_fire_and_forget()).then_some(body))
    }

    async fn subscription(
        self: &Arc<Self>,
        op: SubscriptionOp,
        csp: &str,
        tid: i64,
        params: Vec<Value>,
    ) -> Result<Option<Body>> {
        match op {
            SubscriptionOp::RegisterSubscriber => {
                let ctx = RequestContext::parse(csp)?;
                let forwarder = if ctx.view_type() == Some(ViewType::Topology) {
                    let subscriber = self.tree.register_topology_subscriber(csp).await?;
                    self.track(tid, csp, subscriber.id());
                    self.forward(tid, subscriber, TopologyEvent::to_value)
                } else {
                    let subscriber = self.tree.register_subscriber(csp).await?;
                    self.track(tid, csp, subscriber.id());
                    self.forward(tid, subscriber, MapEvent::to_value)
                };
                if let Some(previous) = self.forwarders.lock().insert(tid, forwarder) {
                    previous.abort();
                }
                Ok(None)
            }
            SubscriptionOp::UnregisterSubscriber => {
                let target = param(&params, 0, "tid")?
                    .as_i64()
                    .ok_or_else(|| Error::protocol("unregisterSubscriber expects a tid"))?;
                let registered = self.subscriptions.lock().remove(&target);
                match registered {
                    Some((registered_csp, id)) => {
                        // the forwarder writes onEndOfSubscription and exits
                        self.tree.unregister_subscriber(&registered_csp, id).await?;
                    }
                    None => {
                        tracing::debug!(peer = %self.peer, tid = target, "no such subscription");
                    }
                }
                Ok(Some(Body::Empty))
            }
            SubscriptionOp::OnEvent | SubscriptionOp::OnEndOfSubscription => {
                Err(Error::UnsupportedEvent {
                    event: op.as_str().to_string(),
                })
            }
        }
    }

    fn track(&self, tid: i64, csp: &str, id: SubscriberId) {
        self.subscriptions.lock().insert(tid, (csp.to_string(), id));
        tracing::debug!(peer = %self.peer, tid, %csp, "forwarding subscription");
    }

    /// Push a subscriber's deliveries to the peer on `tid` until it ends.
    fn forward<E>(
        &self,
        tid: i64,
        mut subscriber: Subscriber<E>,
        encode: fn(&E) -> Value,
    ) -> JoinHandle<()>
    where
        E: Send + 'static,
    {
        let writer = self.writer.clone();
        let subscriptions = self.subscriptions.clone();
        tokio::spawn(async move {
            while let Some(delivery) = subscriber.recv().await {
                let body = match delivery {
                    Delivery::Event(event) => {
                        Body::event(SubscriptionOp::OnEvent.as_str(), vec![encode(&event)])
                    }
                    Delivery::EndOfSubscription => {
                        Body::event(SubscriptionOp::OnEndOfSubscription.as_str(), vec![])
                    }
                };
                if writer.write(&Document::new(Header::new(tid), body)).await.is_err() {
                    break;
                }
            }
            subscriptions.lock().remove(&tid);
        })
    }

    async fn replication(
        self: &Arc<Self>,
        op: ReplicationOp,
        csp: &str,
        tid: i64,
        params: Vec<Value>,
    ) -> Result<Option<Body>> {
        let ctx = RequestContext::parse(csp)?;
        let replication = self
            .tree
            .acquire_view(&ctx.for_view(ViewType::Replication))?
            .into_replication()?;
        let local = replication.identifier();
        let path = ctx.path().to_string();

        match op {
            ReplicationOp::Identifier => {
                let remote = HostId::from_value(&param(&params, 0, "identifier")?)?;
                if remote == local {
                    return Err(Error::protocol(format!(
                        "peer has the same host id {}",
                        local
                    )));
                }
                tracing::debug!(peer = %self.peer, %path, %local, %remote, "identified peer");
                Ok(Some(Body::event(
                    ReplicationOp::IdentifierReply.as_str(),
                    vec![local.to_value()],
                )))
            }
            ReplicationOp::ReplicationSubscribe => {
                let remote = HostId::from_value(&param(&params, 0, "identifier")?)?;
                self.links.lock().insert((path, remote), tid);
                Ok(None)
            }
            ReplicationOp::Bootstrap => {
                let theirs = Bootstrap::from_value(&param(&params, 0, "bootstrap")?)?;
                let ours = Bootstrap {
                    identifier: local,
                    last_updated_time: replication.last_modification_time(theirs.identifier),
                };
                let key = (path, theirs.identifier);
                let push_tid = self.links.lock().get(&key).copied();
                match push_tid {
                    Some(push_tid) => self.start_delivery(key, replication, theirs, push_tid),
                    None => tracing::debug!(
                        peer = %self.peer,
                        remote = %theirs.identifier,
                        "bootstrap without a subscription, not streaming"
                    ),
                }
                Ok(Some(bootstrap_body(&ours)))
            }
            ReplicationOp::ReplicationEvent => {
                apply_event(replication.as_ref(), &params)?;
                Ok(None)
            }
            ReplicationOp::IdentifierReply => Err(Error::UnsupportedEvent {
                event: op.as_str().to_string(),
            }),
        }
    }

    /// Push local entries to a peer on its subscription tid, replacing any
    /// stream already running for the same path and peer.
    fn start_delivery(
        &self,
        key: LinkKey,
        replication: Arc<dyn EngineReplication>,
        theirs: Bootstrap,
        push_tid: i64,
    ) {
        let iterator = replication.acquire_modification_iterator(theirs.identifier);
        begin_streaming(replication.as_ref(), &theirs);
        tracing::info!(
            peer = %self.peer,
            path = %key.0,
            local = %replication.identifier(),
            remote = %theirs.identifier,
            resume_from = theirs.last_updated_time,
            "replication streaming"
        );

        let writer = self.writer.clone();
        let local = replication.identifier();
        let floor = theirs.last_updated_time;
        let task = tokio::spawn(async move {
            let result = deliver(&iterator, local, floor, |entry| {
                let writer = writer.clone();
                async move {
                    let body = Body::event(
                        ReplicationOp::ReplicationEvent.as_str(),
                        vec![entry.to_value()],
                    );
                    writer.write(&Document::new(Header::new(push_tid), body)).await
                }
            })
            .await;
            if let Err(e) = result {
                tracing::debug!(
                    remote = %iterator.remote(),
                    error = %e,
                    "replication delivery ended"
                );
            }
        });
        if let Some(previous) = self.deliveries.lock().insert(key, task) {
            previous.abort();
        }
    }

    /// Release everything the connection held.
    async fn close(&self) {
        for (_, task) in self.deliveries.lock().drain() {
            task.abort();
        }
        for (_, task) in self.forwarders.lock().drain() {
            task.abort();
        }
        let subscriptions: Vec<(String, SubscriberId)> = self
            .subscriptions
            .lock()
            .drain()
            .map(|(_, registered)| registered)
            .collect();
        for (csp, id) in subscriptions {
            if let Err(e) = self.tree.unregister_subscriber(&csp, id).await {
                tracing::debug!(%csp, error = %e, "could not unregister subscriber");
            }
        }
        self.links.lock().clear();
        self.handles.lock().clear();
        let _ = self.writer.shutdown().await;
        tracing::debug!(peer = %self.peer, "session closed");
    }
}

/// Resolve once `shutdown` flips to true or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Requests are ordered per path: the csp without its query.
fn queue_key(header: &Header) -> String {
    let csp = header.csp.as_deref().unwrap_or_default();
    csp.split_once('?').map_or(csp, |(path, _)| path).to_string()
}

/// Whether a failed request gets an exception reply. Fire-and-forget
/// requests fail silently; everything else, unknown events included, is
/// answered so the caller is not left waiting.
fn owes_reply(header: &Header, name: &str) -> bool {
    if header.cid.is_some() {
        return true;
    }
    if let Ok(op) = name.parse::<ReplicationOp>() {
        return !op.is_fire_and_forget();
    }
    match name.parse::<MapOp>() {
        Ok(op) => !op.is_fire_and_forget(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_and_forget_failures_are_silent() {
        let header = Header::new(1).with_csp("/orders");
        assert!(!owes_reply(&header, "put"));
        assert!(!owes_reply(&header, "remove"));
        assert!(!owes_reply(&header, "asyncUpdate"));
        assert!(!owes_reply(&header, "replicationEvent"));
        assert!(owes_reply(&header, "get"));
        assert!(owes_reply(&header, "registerSubscriber"));
        assert!(owes_reply(&header, "noSuchEvent"));
        // a handle's remove is a collection op and is answered
        assert!(owes_reply(&header.clone().with_cid(3), "remove"));
    }

    #[test]
    fn requests_queue_by_path() {
        let store = Header::new(1).with_csp("/orders?view=store");
        let keys = Header::new(2).with_csp("/orders?view=keySet").with_cid(1);
        let other = Header::new(3).with_csp("/prices");
        assert_eq!(queue_key(&store), "/orders");
        assert_eq!(queue_key(&keys), "/orders");
        assert_eq!(queue_key(&other), "/prices");
        assert_eq!(queue_key(&Header::new(4)), "");
    }
}
