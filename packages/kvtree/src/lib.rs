//! kvtree: a distributed, hierarchically addressed key-value store
//!
//! Resources live in a tree and are addressed by path and query, for example
//! `/orders?view=map&valueType=Long`. The same views work over local
//! in-memory stores and over proxies to another host, and stores can be
//! replicated between hosts with last-writer-wins conflict resolution.
//!
//! This crate ties the layers together:
//! - [`Node`]: a served tree plus its replication hubs
//! - [`Client`]: a tree whose stores live on a remote host
//! - [`Config`]: JSON configuration for both
//!
//! # Example
//!
//! ```rust,no_run
//! use kvtree::{Client, Config, Node, Value};
//!
//! # async fn example() -> kvtree::Result<()> {
//! let node = Node::start(&Config::default()).await?;
//! let client = Client::connect(node.local_addr()?, &Default::default()).await?;
//!
//! let orders = client.tree().acquire_map("/orders")?;
//! orders.put(Value::from("A"), Value::from("1")).await?;
//! assert_eq!(orders.get(&Value::from("A")).await?, Some(Value::from("1")));
//! # Ok(())
//! # }
//! ```

mod config;
mod node;

pub use config::{ClientConfig, Config, ReplicationConfig, ServerConfig};
pub use node::{Client, Node};

pub use kvtree_core_store::{
    AssetTree, CollectionKind, CollectionView, Delivery, EngineReplication, Error, ErrorKind,
    HostId, KeyValueStore, MapEvent, MapFunction, MapView, ReferenceView, RequestContext,
    Result, Subscriber, SubscriberId, Subscription, SubscriptionOptions, TopicPublisher,
    TopologyEvent, TopologySubscription, Value, ViewType,
};
pub use kvtree_remote::{install_remote_rules, RemoteKeyValueStore};
pub use kvtree_replication::{ReplicationHub, ReplicationOptions, SessionState};
pub use kvtree_server::{ServerEndpoint, ServerOptions};
pub use kvtree_wire::{Connection, ConnectionOptions, WireType};
