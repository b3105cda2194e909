//! The resource tree.
//!
//! [`AssetTree`] is the entry point: it turns path+query addresses into
//! views. Nodes are created on first access and live as long as the tree.
//! Which implementation backs a view is decided by the rules registered on
//! the nodes; [`install_local_rules`] gives every node in-memory storage,
//! and other crates install rules that mount remote stores instead.
//!
//! # Example
//!
//! ```rust
//! use kvtree_core_store::{AssetTree, Value};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let tree = AssetTree::for_testing();
//! let orders = tree.acquire_map("/orders").unwrap();
//! orders.put(Value::from("A"), Value::from("1")).await.unwrap();
//!
//! // Acquisition is memoized per node and capability.
//! let again = tree.acquire_map("/orders").unwrap();
//! assert_eq!(again.get(&Value::from("A")).await.unwrap(), Some(Value::from("1")));
//! # });
//! ```

use std::sync::Arc;

use parking_lot::RwLock;

use crate::asset::{AccessCheck, TreeShared};
use crate::view::{Rule, ViewFactory};
use crate::{
    Asset, CollectionKind, CollectionView, EngineReplication, Error, FunctionRegistry, HostId,
    InMemoryStore, KeyValueStore, MapCollection, MapEvent, MapView, Path, PathTrie,
    ReferenceView, RequestContext, Result, Subscriber, SubscriberId, Subscription,
    SubscriptionHub, SubscriptionOptions, TopicPublisher, TopologyEvent, TopologyHub,
    TopologySubscription, TypeRegistry, Value, View, ViewType,
};

/// A hierarchical namespace of resource nodes.
pub struct AssetTree {
    root: Arc<Asset>,
    shared: Arc<TreeShared>,
}

impl AssetTree {
    /// An empty tree with no rules, for host 1.
    pub fn new() -> Self {
        Self::with_host(HostId::default())
    }

    /// An empty tree with no rules for the given host.
    pub fn with_host(host_id: HostId) -> Self {
        let shared = Arc::new(TreeShared {
            rules: RwLock::new(PathTrie::new()),
            types: Arc::new(TypeRegistry::default()),
            functions: Arc::new(FunctionRegistry::default()),
            host_id,
            access_checks: RwLock::new(Vec::new()),
        });
        Self {
            root: Asset::root(shared.clone()),
            shared,
        }
    }

    /// A tree with in-memory storage everywhere, for host 1.
    pub fn for_testing() -> Self {
        let tree = Self::new();
        install_local_rules(&tree);
        tree
    }

    /// A tree with in-memory storage everywhere for the given host.
    pub fn for_host(host_id: HostId) -> Self {
        let tree = Self::with_host(host_id);
        install_local_rules(&tree);
        tree
    }

    pub fn root(&self) -> &Arc<Asset> {
        &self.root
    }

    pub fn host_id(&self) -> HostId {
        self.shared.host_id
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.shared.types
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.shared.functions
    }

    /// The node at `path`, creating it and any missing ancestors.
    pub fn acquire_asset(&self, path: &Path) -> Result<Arc<Asset>> {
        let mut node = self.root.clone();
        for component in path.iter() {
            node = node.acquire_child(component)?;
        }
        Ok(node)
    }

    /// The node at `path` if it exists. Never creates nodes.
    pub fn get_asset(&self, path: &Path) -> Option<Arc<Asset>> {
        let mut node = self.root.clone();
        for component in path.iter() {
            node = node.get_child(component)?;
        }
        Some(node)
    }

    /// Register a rule on the node at `path`.
    pub fn add_rule(
        &self,
        path: &Path,
        view: ViewType,
        description: &str,
        factory: ViewFactory,
    ) -> Result<()> {
        self.acquire_asset(path)?
            .add_rule(Rule::new(view, description, factory));
        Ok(())
    }

    /// Install a check that runs before every view acquisition.
    pub fn add_access_check<F>(&self, check: F)
    where
        F: Fn(&RequestContext) -> Result<()> + Send + Sync + 'static,
    {
        let check: Arc<AccessCheck> = Arc::new(check);
        self.shared.access_checks.write().push(check);
    }

    /// Acquire the view a parsed context asks for.
    pub fn acquire_view(&self, ctx: &RequestContext) -> Result<View> {
        self.acquire_asset(ctx.path())?.acquire_view(ctx)
    }

    /// Parse `uri`, defaulting the view to `view`. A uri that asks for a
    /// different view is rejected.
    fn context_for(&self, uri: &str, view: ViewType) -> Result<RequestContext> {
        let mut ctx = RequestContext::parse(uri)?;
        match ctx.view_type() {
            None => {
                ctx.set_view_type(view)?;
            }
            Some(requested) if requested == view => {}
            Some(requested) => {
                return Err(Error::invalid_argument(format!(
                    "{} asks for a {} view, expected {}",
                    uri, requested, view
                )))
            }
        }
        Ok(ctx)
    }

    pub fn acquire_map(&self, uri: &str) -> Result<Arc<MapView>> {
        let ctx = self.context_for(uri, ViewType::Map)?;
        self.acquire_view(&ctx)?.into_map()
    }

    pub fn acquire_store(&self, uri: &str) -> Result<Arc<dyn KeyValueStore>> {
        let ctx = self.context_for(uri, ViewType::Store)?;
        self.acquire_view(&ctx)?.into_store()
    }

    pub fn acquire_subscription(&self, uri: &str) -> Result<Arc<dyn Subscription>> {
        let ctx = self.context_for(uri, ViewType::Subscription)?;
        self.acquire_view(&ctx)?.into_subscription()
    }

    pub fn acquire_reference(&self, uri: &str) -> Result<Arc<ReferenceView>> {
        let ctx = self.context_for(uri, ViewType::Reference)?;
        self.acquire_view(&ctx)?.into_reference()
    }

    pub fn acquire_publisher(&self, uri: &str) -> Result<Arc<TopicPublisher>> {
        let ctx = self.context_for(uri, ViewType::Publisher)?;
        self.acquire_view(&ctx)?.into_publisher()
    }

    pub fn acquire_replication(&self, uri: &str) -> Result<Arc<dyn EngineReplication>> {
        let ctx = self.context_for(uri, ViewType::Replication)?;
        self.acquire_view(&ctx)?.into_replication()
    }

    /// Acquire a key set, value or entry set view. The uri must name one.
    pub fn acquire_collection(&self, uri: &str) -> Result<Arc<dyn CollectionView>> {
        let ctx = RequestContext::parse(uri)?;
        match ctx.view_type() {
            Some(view) if view.is_collection() => self.acquire_view(&ctx)?.into_collection(),
            _ => Err(Error::invalid_argument(format!(
                "{} does not name a keySet, values or entrySet view",
                uri
            ))),
        }
    }

    /// Subscribe to the map at `uri`, using its `bootstrap`,
    /// `endSubscriptionAfterBootstrap` and `nullOldValueOnUpdateEvent`
    /// options.
    pub async fn register_subscriber(&self, uri: &str) -> Result<Subscriber<MapEvent>> {
        let ctx = self.context_for(uri, ViewType::Subscription)?;
        let asset = self.acquire_asset(ctx.path())?;
        // The store attaches itself as the bootstrap source when it is built.
        asset.acquire_view(&ctx.for_view(ViewType::Store))?;
        let subscription = asset.acquire_view(&ctx)?.into_subscription()?;
        subscription
            .register_subscriber(SubscriptionOptions::from_context(&ctx))
            .await
    }

    /// End a subscriber registered through [`AssetTree::register_subscriber`]
    /// or, when `uri` names a topology view, through
    /// [`AssetTree::register_topology_subscriber`].
    pub async fn unregister_subscriber(&self, uri: &str, id: SubscriberId) -> Result<()> {
        let ctx = RequestContext::parse(uri)?;
        if ctx.view_type() == Some(ViewType::Topology) {
            return self
                .acquire_view(&ctx)?
                .into_topology()?
                .unregister_subscriber(id)
                .await;
        }
        self.acquire_subscription(uri)?
            .unregister_subscriber(id)
            .await
    }

    pub fn acquire_topology(&self, uri: &str) -> Result<Arc<dyn TopologySubscription>> {
        let ctx = self.context_for(uri, ViewType::Topology)?;
        self.acquire_view(&ctx)?.into_topology()
    }

    /// Watch children appear below the node at `uri`. With the `bootstrap`
    /// option the current children come first.
    pub async fn register_topology_subscriber(
        &self,
        uri: &str,
    ) -> Result<Subscriber<TopologyEvent>> {
        let ctx = self.context_for(uri, ViewType::Topology)?;
        self.acquire_view(&ctx)?
            .into_topology()?
            .register_subscriber(ctx.bootstrap())
            .await
    }

    /// Drop every view in the tree, ending all subscriptions.
    pub fn close(&self) {
        tracing::debug!("closing tree");
        self.root.close();
    }
}

impl Default for AssetTree {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AssetTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetTree")
            .field("host_id", &self.shared.host_id)
            .field("root", &self.root)
            .finish()
    }
}

/// Register the default rules at the root of `tree`: in-memory stores with a
/// local subscription hub, and the map, collection, reference, publisher
/// and replication views layered on them.
pub fn install_local_rules(tree: &AssetTree) {
    let root = tree.root();
    root.add_rule(Rule::new(
        ViewType::Topology,
        "local topology hub",
        ViewFactory::leaf(|ctx, asset| {
            let hub = TopologyHub::new(ctx.full_name(), Arc::downgrade(asset));
            Ok(View::Topology(Arc::new(hub)))
        }),
    ));
    root.add_rule(Rule::new(
        ViewType::Subscription,
        "local subscription hub",
        ViewFactory::leaf(|ctx, _| {
            let hub = SubscriptionHub::new(ctx.full_name());
            Ok(View::Subscription(Arc::new(hub)))
        }),
    ));
    root.add_rule(Rule::new(
        ViewType::Store,
        "in-memory store",
        ViewFactory::leaf(|ctx, asset| {
            let hub = asset
                .acquire_view(&ctx.for_view(ViewType::Subscription))?
                .into_subscription()?;
            let store =
                InMemoryStore::new(ctx.full_name(), asset.host_id(), asset.functions().clone())
                    .publishing_to(hub);
            Ok(View::Store(store))
        }),
    ));
    install_layered_rules(root);
}

/// Register the rules for every view that is layered over a store and a
/// subscription. Trees that mount remote stores use these unchanged.
pub fn install_layered_rules(root: &Arc<Asset>) {
    root.add_rule(Rule::new(
        ViewType::Map,
        "map over store",
        ViewFactory::wrapping(ViewType::Store, |ctx, asset, store| {
            let map = MapView::new(
                ctx.clone(),
                Arc::downgrade(asset),
                store.into_store()?,
                asset.types().clone(),
            )?;
            Ok(View::Map(Arc::new(map)))
        }),
    ));
    for kind in [
        CollectionKind::KeySet,
        CollectionKind::Values,
        CollectionKind::EntrySet,
    ] {
        root.add_rule(Rule::new(
            kind.view_type(),
            "collection over map",
            ViewFactory::wrapping(ViewType::Map, move |_, _, map| {
                let store = map.into_map()?.store().clone();
                Ok(View::Collection(Arc::new(MapCollection::new(kind, store))))
            }),
        ));
    }
    root.add_rule(Rule::new(
        ViewType::Reference,
        "reference into parent map",
        ViewFactory::wrapping_parent(ViewType::Map, |ctx, asset, map| {
            let reference = ReferenceView::new(
                Value::from(ctx.name()),
                map.into_map()?,
                asset.functions().clone(),
            );
            Ok(View::Reference(Arc::new(reference)))
        }),
    ));
    root.add_rule(Rule::new(
        ViewType::Publisher,
        "topic publisher over map",
        ViewFactory::wrapping(ViewType::Map, |_, _, map| {
            Ok(View::Publisher(Arc::new(TopicPublisher::new(map.into_map()?))))
        }),
    ));
    root.add_rule(Rule::new(
        ViewType::Replication,
        "replication of store",
        ViewFactory::wrapping(ViewType::Store, |ctx, _, store| {
            store
                .into_store()?
                .as_replication()
                .map(View::Replication)
                .ok_or_else(|| {
                    Error::unsupported(format!("replication of /{}", ctx.path()))
                })
        }),
    ));
}
