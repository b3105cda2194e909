//! The client end of a wire connection.
//!
//! A [`Connection`] multiplexes many outstanding calls and subscriptions
//! over one byte stream. Each request gets a fresh transaction id; one
//! reader task routes every inbound document by tid, either to the one-shot
//! waiter of a call or to the listener of a subscription.
//!
//! When the stream ends, every pending call fails with
//! [`Error::ConnectionClosed`] and every listener channel closes, which its
//! consumer reads as the end of the subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kvtree_core_store::{Error, Result, Value};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::frame::{read_document, FrameWriter, DEFAULT_MAX_FRAME};
use crate::{BinaryWire, Body, Document, Header, SubscriptionOp, WireCodec};

/// How a connection encodes documents and how long calls may wait.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub codec: Arc<dyn WireCodec>,
    pub call_timeout: Duration,
    pub max_frame: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            codec: Arc::new(BinaryWire),
            call_timeout: Duration::from_secs(10),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl ConnectionOptions {
    pub fn with_codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Receives the pushes of one subscription.
pub type Listener = mpsc::UnboundedReceiver<Body>;

enum Pending {
    Call(oneshot::Sender<Body>),
    Listener(mpsc::UnboundedSender<Body>),
}

/// State shared between the connection and its reader task.
struct Routing {
    pending: Mutex<HashMap<i64, Pending>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Routing {
    fn route(&self, document: Document) {
        let tid = document.header.tid;
        let mut pending = self.pending.lock();
        match pending.remove(&tid) {
            Some(Pending::Call(waiter)) => {
                let _ = waiter.send(document.body);
            }
            Some(Pending::Listener(listener)) => {
                let terminal = matches!(
                    &document.body,
                    Body::Event { name, .. } if name == SubscriptionOp::OnEndOfSubscription.as_str()
                ) || matches!(document.body, Body::Exception { .. });
                if listener.send(document.body).is_ok() && !terminal {
                    pending.insert(tid, Pending::Listener(listener));
                }
            }
            None => {
                tracing::debug!(tid, "dropping document with no waiter");
            }
        }
    }

    /// Fail every waiter and end every listener.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        tracing::debug!(outstanding = drained.len(), "connection closed");
        drop(drained);
        self.closed_tx.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct Inner {
    peer: String,
    writer: FrameWriter,
    next_tid: AtomicI64,
    call_timeout: Duration,
    routing: Arc<Routing>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.routing.close();
    }
}

/// A multiplexed client connection. Cloning shares the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Open a TCP connection.
    pub async fn connect<A>(addr: A, options: ConnectionOptions) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        tracing::debug!(%peer, codec = options.codec.name(), "connected");
        let (read, write) = stream.into_split();
        Ok(Self::start(read, write, options, peer))
    }

    /// Run the protocol over any byte stream, such as one half of a
    /// `tokio::io::duplex`.
    pub fn from_stream<S>(stream: S, options: ConnectionOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::start(read, write, options, "stream".to_string())
    }

    fn start<R, W>(read: R, write: W, options: ConnectionOptions, peer: String) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed_tx, _) = watch::channel(false);
        let routing = Arc::new(Routing {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            closed_tx,
        });
        let writer = FrameWriter::new(write, options.codec.clone(), options.max_frame);
        let reader = tokio::spawn(read_loop(
            read,
            options.codec.clone(),
            options.max_frame,
            routing.clone(),
            peer.clone(),
        ));
        Self {
            inner: Arc::new(Inner {
                peer,
                writer,
                next_tid: AtomicI64::new(1),
                call_timeout: options.call_timeout,
                routing,
                reader: Mutex::new(Some(reader)),
            }),
        }
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.routing.is_closed()
    }

    /// Resolve once the connection has closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.routing.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn next_tid(&self) -> i64 {
        self.inner.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, tid: i64, pending: Pending) -> Result<()> {
        let mut table = self.inner.routing.pending.lock();
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        table.insert(tid, pending);
        Ok(())
    }

    fn release(&self, tid: i64) {
        self.inner.routing.pending.lock().remove(&tid);
    }

    async fn write(&self, document: &Document) -> Result<()> {
        if let Err(e) = self.inner.writer.write(document).await {
            if matches!(e, Error::Io(_)) {
                tracing::warn!(peer = %self.inner.peer, error = %e, "write failed, closing");
                self.inner.routing.close();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Send a request and wait for its reply. An exception reply becomes
    /// an error of the same family.
    pub async fn call(
        &self,
        csp: &str,
        cid: Option<i64>,
        event: &str,
        params: Vec<Value>,
    ) -> Result<Body> {
        let tid = self.next_tid();
        let (tx, rx) = oneshot::channel();
        self.register(tid, Pending::Call(tx))?;

        let document = Document::new(header(tid, csp, cid), Body::event(event, params));
        if let Err(e) = self.write(&document).await {
            self.release(tid);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.call_timeout, rx).await {
            Ok(Ok(body)) => body.into_result(),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.release(tid);
                tracing::warn!(tid, event, csp, "call timed out");
                Err(Error::Timeout { tid })
            }
        }
    }

    /// Send a request that gets no reply. Returns once it is written.
    pub async fn send(
        &self,
        csp: &str,
        cid: Option<i64>,
        event: &str,
        params: Vec<Value>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let tid = self.next_tid();
        let document = Document::new(header(tid, csp, cid), Body::event(event, params));
        self.write(&document).await
    }

    /// Send a request whose answers arrive as pushes on its tid. The
    /// listener is in place before the request is written, so no push can
    /// be missed.
    pub async fn subscribe(
        &self,
        csp: &str,
        event: &str,
        params: Vec<Value>,
    ) -> Result<(i64, Listener)> {
        let tid = self.next_tid();
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(tid, Pending::Listener(tx))?;

        let document = Document::new(header(tid, csp, None), Body::event(event, params));
        if let Err(e) = self.write(&document).await {
            self.release(tid);
            return Err(e);
        }
        Ok((tid, rx))
    }

    /// Stop routing pushes for `tid`. The listener channel closes.
    pub fn unsubscribe(&self, tid: i64) {
        self.release(tid);
    }

    /// Shut the connection down. Outstanding calls fail.
    pub async fn close(&self) {
        if let Err(e) = self.inner.writer.shutdown().await {
            tracing::debug!(error = %e, "shutdown failed");
        }
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        self.inner.routing.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn header(tid: i64, csp: &str, cid: Option<i64>) -> Header {
    Header {
        tid,
        csp: Some(csp.to_string()),
        cid,
    }
}

async fn read_loop<R>(
    mut reader: R,
    codec: Arc<dyn WireCodec>,
    max_frame: usize,
    routing: Arc<Routing>,
    peer: String,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_document(&mut reader, codec.as_ref(), max_frame).await {
            Ok(Some(document)) => {
                tracing::trace!(%peer, tid = document.header.tid, "received");
                routing.route(document);
            }
            Ok(None) => {
                tracing::debug!(%peer, "peer closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "read failed");
                break;
            }
        }
    }
    routing.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_document;
    use crate::TextWire;
    use kvtree_core_store::ErrorKind;
    use tokio::io::{DuplexStream, ReadHalf};

    struct FakeServer {
        reader: ReadHalf<DuplexStream>,
        writer: FrameWriter,
    }

    impl FakeServer {
        async fn next(&mut self) -> Option<Document> {
            read_document(&mut self.reader, &TextWire, DEFAULT_MAX_FRAME)
                .await
                .unwrap()
        }

        async fn reply(&self, tid: i64, body: Body) {
            self.writer
                .write(&Document::new(Header::new(tid), body))
                .await
                .unwrap();
        }
    }

    fn pair(timeout: Duration) -> (Connection, FakeServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let options = ConnectionOptions::default()
            .with_codec(Arc::new(TextWire))
            .with_call_timeout(timeout);
        let connection = Connection::from_stream(client, options);
        let (reader, writer) = tokio::io::split(server);
        let server = FakeServer {
            reader,
            writer: FrameWriter::new(writer, Arc::new(TextWire), DEFAULT_MAX_FRAME),
        };
        (connection, server)
    }

    #[tokio::test]
    async fn replies_are_matched_by_tid() {
        let (connection, mut server) = pair(Duration::from_secs(5));

        let first = tokio::spawn({
            let connection = connection.clone();
            async move { connection.call("/a", None, "get", vec![Value::from("x")]).await }
        });
        let second = tokio::spawn({
            let connection = connection.clone();
            async move { connection.call("/a", None, "size", vec![]).await }
        });

        let a = server.next().await.unwrap();
        let b = server.next().await.unwrap();
        assert_ne!(a.header.tid, b.header.tid);
        // answer in reverse order
        for doc in [b, a] {
            let Body::Event { name, .. } = &doc.body else {
                panic!("expected a request");
            };
            let reply = if name == "size" {
                Value::Integer(3)
            } else {
                Value::from("y")
            };
            server.reply(doc.header.tid, Body::Reply(reply)).await;
        }

        assert_eq!(first.await.unwrap().unwrap(), Body::Reply(Value::from("y")));
        assert_eq!(second.await.unwrap().unwrap(), Body::Reply(Value::Integer(3)));
    }

    #[tokio::test]
    async fn exception_reply_is_error() {
        let (connection, mut server) = pair(Duration::from_secs(5));
        let call = tokio::spawn(async move { connection.call("/a", None, "get", vec![]).await });

        let request = server.next().await.unwrap();
        server
            .reply(
                request.header.tid,
                Body::Exception {
                    kind: ErrorKind::InvalidArgument,
                    message: "key can not be null".to_string(),
                },
            )
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let (connection, mut server) = pair(Duration::from_millis(50));
        let err = connection.call("/a", None, "get", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(server.next().await.is_some());
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn close_fails_pending_calls() {
        let (connection, server) = pair(Duration::from_secs(5));
        let call = tokio::spawn({
            let connection = connection.clone();
            async move { connection.call("/a", None, "get", vec![]).await }
        });
        tokio::task::yield_now().await;
        drop(server);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed) || matches!(err, Error::Io(_)));
        connection.closed().await;
        assert!(connection.is_closed());
        assert!(matches!(
            connection.call("/a", None, "get", vec![]).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn pushes_reach_the_listener_until_end() {
        let (connection, mut server) = pair(Duration::from_secs(5));
        let (tid, mut listener) = connection
            .subscribe("/a?view=subscription", "registerSubscriber", vec![])
            .await
            .unwrap();

        let request = server.next().await.unwrap();
        assert_eq!(request.header.tid, tid);
        server
            .reply(tid, Body::event("onEvent", vec![Value::from("e1")]))
            .await;
        server
            .reply(tid, Body::event("onEndOfSubscription", vec![]))
            .await;

        assert_eq!(
            listener.recv().await,
            Some(Body::event("onEvent", vec![Value::from("e1")]))
        );
        assert_eq!(
            listener.recv().await,
            Some(Body::event("onEndOfSubscription", vec![]))
        );
        assert_eq!(listener.recv().await, None);
    }

    #[tokio::test]
    async fn fire_and_forget_writes_without_waiting() {
        let (connection, mut server) = pair(Duration::from_secs(5));
        connection
            .send("/a", None, "put", vec![Value::from("k"), Value::from("v")])
            .await
            .unwrap();
        let request = server.next().await.unwrap();
        assert_eq!(
            request.body,
            Body::event("put", vec![Value::from("k"), Value::from("v")])
        );
    }
}
