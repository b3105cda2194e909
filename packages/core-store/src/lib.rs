//! kvtree core: the resource tree and the store contract
//!
//! This layer names resources and hands out capabilities over them:
//! - `Path`: Validated, normalized resource path
//! - `RequestContext`: A parsed path+query address of a view
//! - `AssetTree` / `Asset`: The hierarchical namespace and its nodes
//! - `KeyValueStore`: The async store contract, local or remote
//! - `MapView`, `CollectionView`, `Subscription`, `ReferenceView`,
//!   `TopicPublisher`, `EngineReplication`: The views a node can expose
//!
//! It has no networking of its own. The wire, remote and replication crates
//! plug in through rules and the traits defined here.
//!
//! # Example
//!
//! ```rust
//! use kvtree_core_store::{AssetTree, RequestContext, Value, ViewType};
//!
//! let ctx = RequestContext::parse("/orders?view=map&valueType=Long").unwrap();
//! assert_eq!(ctx.view_type(), Some(ViewType::Map));
//!
//! let tree = AssetTree::for_testing();
//! let view = tree.acquire_view(&ctx).unwrap();
//! assert_eq!(view.view_type(), ViewType::Map);
//! ```

mod asset;
mod collection;
mod context;
mod error;
mod event;
mod function;
mod map_view;
mod memory_store;
mod path;
mod path_trie;
mod reference;
mod replication;
mod subscription;
mod topology;
mod traits;
mod tree;
mod types;
mod value;
mod view;

pub use asset::{AccessCheck, Asset};
pub use collection::{segments_for, MapCollection, SEGMENT_SIZE};
pub use context::{RequestContext, ViewType};
pub use error::{Error, ErrorKind, Result};
pub use event::{
    subscriber_channel, Delivery, MapEvent, Subscriber, SubscriberId, SubscriberSink,
    SubscriptionOptions,
};
pub use function::{
    hash_entries, FunctionRegistry, KeyFunction, MapAccess, MapFunction, MapOperation,
};
pub use map_view::MapView;
pub use memory_store::InMemoryStore;
pub use path::{Path, PathError};
pub use path_trie::PathTrie;
pub use reference::{ReferenceView, TopicPublisher};
pub use replication::{Bootstrap, EngineReplication, HostId, ModificationIterator, ReplicationEntry};
pub use subscription::SubscriptionHub;
pub use topology::{TopologyEvent, TopologyHub, TopologySubscription};
pub use traits::{
    require_non_null, CollectionKind, CollectionView, KeyValueStore, SnapshotSource, Subscription,
};
pub use tree::{install_layered_rules, install_local_rules, AssetTree};
pub use types::{TypeRegistry, TypeSpec};
pub use value::{Value, ValueKind};
pub use view::{resolve_rule, LeafFn, Rule, View, ViewFactory, ViewKey, WrapFn, WrapTarget};
