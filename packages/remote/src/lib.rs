//! kvtree remote stores
//!
//! Proxies that implement the store contract over a wire
//! [`Connection`](kvtree_wire::Connection):
//! - [`RemoteKeyValueStore`]: map operations, one request each
//! - [`RemoteCollection`]: a handle-backed key set, value or entry set
//! - [`RemoteSubscription`]: map events pushed by the server
//! - [`RemoteTopology`]: children appearing on the server
//!
//! [`install_remote_rules`] mounts them in a client tree so that maps,
//! references and publishers work against a remote host as they do locally.

mod collection;
mod rules;
mod store;
mod subscription;
mod topology;

pub use collection::RemoteCollection;
pub use rules::install_remote_rules;
pub use store::RemoteKeyValueStore;
pub use subscription::RemoteSubscription;
pub use topology::RemoteTopology;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use kvtree_core_store::AssetTree;
    use kvtree_server::{ServerEndpoint, ServerOptions};
    use kvtree_wire::{Connection, ConnectionOptions};

    /// An in-memory server and a client connection to it over a duplex
    /// stream. Keep the endpoint alive for as long as the connection is
    /// used.
    pub(crate) fn served() -> (ServerEndpoint, Connection) {
        let server =
            ServerEndpoint::new(Arc::new(AssetTree::for_testing()), ServerOptions::default());
        let (client, stream) = tokio::io::duplex(64 * 1024);
        server.serve_stream(stream, "duplex");
        (server, Connection::from_stream(client, ConnectionOptions::default()))
    }
}
