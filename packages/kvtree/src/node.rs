//! Running a host: a served tree plus its replication hubs, and the client
//! side that mounts a remote host's tree.

use std::net::SocketAddr;
use std::sync::Arc;

use kvtree_core_store::{AssetTree, Error, Result};
use kvtree_remote::install_remote_rules;
use kvtree_replication::{ReplicationHub, ReplicationOptions};
use kvtree_server::ServerEndpoint;
use kvtree_wire::Connection;
use tokio::net::ToSocketAddrs;
use tokio::task::JoinHandle;

use crate::{ClientConfig, Config};

/// A host: an in-memory tree served on a socket and replicated with peers.
pub struct Node {
    tree: Arc<AssetTree>,
    server: ServerEndpoint,
    options: ReplicationOptions,
    hubs: Vec<(Arc<ReplicationHub>, JoinHandle<()>)>,
}

impl Node {
    /// Bind the server and start a hub for every configured (peer, path).
    pub async fn start(config: &Config) -> Result<Self> {
        let host_id = config.replication.host_id()?;
        let tree = Arc::new(AssetTree::for_host(host_id));
        let server = ServerEndpoint::bind(
            config.server.bind_address.as_str(),
            tree.clone(),
            config.server.server_options(),
        )
        .await?;
        tracing::info!(%host_id, local_addr = ?server.local_addr(), "node started");

        let mut node = Self {
            tree,
            server,
            options: config.replication.replication_options(&config.client),
            hubs: Vec::new(),
        };
        for peer in &config.replication.peers {
            for path in &config.replication.paths {
                node.replicate(path, peer)?;
            }
        }
        Ok(node)
    }

    pub fn tree(&self) -> &Arc<AssetTree> {
        &self.tree
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server
            .local_addr()
            .ok_or_else(|| Error::not_found("node is not listening"))
    }

    pub fn hubs(&self) -> impl Iterator<Item = &Arc<ReplicationHub>> {
        self.hubs.iter().map(|(hub, _)| hub)
    }

    /// Replicate the store at `path` with the same path on `peer`,
    /// reconnecting until the node shuts down.
    pub fn replicate(&mut self, path: &str, peer: &str) -> Result<Arc<ReplicationHub>> {
        let replication = self.tree.acquire_replication(path)?;
        let hub = Arc::new(ReplicationHub::new(replication, path, self.options.clone())?);
        let task = tokio::spawn({
            let hub = hub.clone();
            let peer = peer.to_string();
            async move { hub.run(peer).await }
        });
        tracing::info!(csp = %hub.csp(), %peer, "replicating");
        self.hubs.push((hub.clone(), task));
        Ok(hub)
    }

    /// Stop every hub, then the server, then the tree.
    pub async fn shutdown(self) {
        for (hub, _) in &self.hubs {
            hub.shutdown();
        }
        for (_, task) in self.hubs {
            let _ = task.await;
        }
        self.server.close().await;
        self.tree.close();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("host_id", &self.tree.host_id())
            .field("server", &self.server)
            .field("hubs", &self.hubs.len())
            .finish()
    }
}

/// A client tree whose stores and subscriptions live on a remote host.
pub struct Client {
    tree: AssetTree,
    connection: Connection,
}

impl Client {
    pub async fn connect<A>(addr: A, config: &ClientConfig) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let connection = Connection::connect(addr, config.connection_options()).await?;
        Ok(Self::over(connection))
    }

    /// Mount the host at the other end of `connection`.
    pub fn over(connection: Connection) -> Self {
        let tree = AssetTree::new();
        install_remote_rules(&tree, connection.clone());
        Self { tree, connection }
    }

    pub fn tree(&self) -> &AssetTree {
        &self.tree
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// End local subscribers, then the connection.
    pub async fn close(&self) {
        self.tree.close();
        self.connection.close().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .finish()
    }
}
