use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kvtree_core_store::{AssetTree, Result};
use kvtree_wire::{BinaryWire, FrameWriter, WireCodec, DEFAULT_MAX_FRAME};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::session::{stopped, Session};

/// How long the accept loop backs off after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Settings for a [`ServerEndpoint`].
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub codec: Arc<dyn WireCodec>,
    pub max_frame: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            codec: Arc::new(BinaryWire),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl ServerOptions {
    pub fn with_codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }
}

struct Shared {
    tree: Arc<AssetTree>,
    options: ServerOptions,
    shutdown: watch::Sender<bool>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn spawn_session<S>(&self, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let codec = self.options.codec.clone();
        let writer = FrameWriter::new(write, codec.clone(), self.options.max_frame);
        let session = Session::new(self.tree.clone(), writer, peer);
        let task = tokio::spawn(session.serve(
            read,
            codec,
            self.options.max_frame,
            self.shutdown.subscribe(),
        ));

        let mut sessions = self.sessions.lock();
        sessions.retain(|session| !session.is_finished());
        sessions.push(task);
    }
}

/// Serves one resource tree to any number of connections.
///
/// Every connection gets its own session with its own handles and
/// subscriptions. Dropping the endpoint stops accepting and ends every
/// session; [`ServerEndpoint::close`] does the same and waits for them.
pub struct ServerEndpoint {
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl ServerEndpoint {
    /// An endpoint with no listener. Connections are handed to it through
    /// [`ServerEndpoint::serve_stream`].
    pub fn new(tree: Arc<AssetTree>, options: ServerOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                tree,
                options,
                shutdown,
                sessions: Mutex::new(Vec::new()),
            }),
            local_addr: None,
            accept: Mutex::new(None),
        }
    }

    /// Listen on `addr` and serve every accepted connection.
    pub async fn bind<A>(addr: A, tree: Arc<AssetTree>, options: ServerOptions) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, codec = options.codec.name(), "server listening");

        let mut endpoint = Self::new(tree, options);
        endpoint.local_addr = Some(local_addr);
        let accept = tokio::spawn(accept_loop(listener, endpoint.shared.clone()));
        *endpoint.accept.lock() = Some(accept);
        Ok(endpoint)
    }

    /// The bound address, if the endpoint listens.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn tree(&self) -> &Arc<AssetTree> {
        &self.shared.tree
    }

    /// Serve one already-connected stream, such as a `tokio::io::duplex`
    /// half.
    pub fn serve_stream<S>(&self, stream: S, peer: impl Into<String>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.shared.spawn_session(stream, peer.into());
    }

    /// Stop accepting, end every session and wait for them to release
    /// their handles and subscriptions.
    pub async fn close(&self) {
        self.shared.shutdown.send_replace(true);
        if let Some(accept) = self.accept.lock().take() {
            accept.abort();
        }
        let sessions: Vec<JoinHandle<()>> = self.shared.sessions.lock().drain(..).collect();
        for session in sessions {
            let _ = session.await;
        }
        tracing::info!(local_addr = ?self.local_addr, "server closed");
    }
}

impl Drop for ServerEndpoint {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        if let Some(accept) = self.accept.lock().take() {
            accept.abort();
        }
    }
}

impl std::fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("local_addr", &self.local_addr)
            .field("codec", &self.shared.options.codec.name())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = stopped(&mut shutdown) => break,
        };
        match accepted {
            Ok((socket, peer)) => {
                if let Err(e) = socket.set_nodelay(true) {
                    tracing::debug!(%peer, error = %e, "could not set nodelay");
                }
                tracing::info!(%peer, "accepted connection");
                shared.spawn_session(socket, peer.to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    tracing::debug!("accept loop stopped");
}
