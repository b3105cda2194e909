//! Views, view factories and acquisition rules.
//!
//! A [`View`] is one capability bound to one resource node. Views are built
//! by [`ViewFactory`]s, which the tree finds through [`Rule`]s registered on
//! nodes and inherited by their descendants.

use std::fmt;
use std::sync::Arc;

use crate::{
    Asset, CollectionView, EngineReplication, Error, KeyValueStore, MapView, ReferenceView,
    RequestContext, Result, Subscription, TopicPublisher, TopologySubscription, ViewType,
};

/// An instantiated capability.
#[derive(Clone)]
pub enum View {
    Store(Arc<dyn KeyValueStore>),
    Map(Arc<MapView>),
    Collection(Arc<dyn CollectionView>),
    Subscription(Arc<dyn Subscription>),
    Reference(Arc<ReferenceView>),
    Publisher(Arc<TopicPublisher>),
    Replication(Arc<dyn EngineReplication>),
    Topology(Arc<dyn TopologySubscription>),
}

impl View {
    pub fn view_type(&self) -> ViewType {
        match self {
            View::Store(_) => ViewType::Store,
            View::Map(_) => ViewType::Map,
            View::Collection(c) => c.kind().view_type(),
            View::Subscription(_) => ViewType::Subscription,
            View::Reference(_) => ViewType::Reference,
            View::Publisher(_) => ViewType::Publisher,
            View::Replication(_) => ViewType::Replication,
            View::Topology(_) => ViewType::Topology,
        }
    }

    fn mismatch(&self, expected: &str) -> Error {
        Error::invalid_argument(format!(
            "expected a {} view, found {}",
            expected,
            self.view_type()
        ))
    }

    pub fn into_store(self) -> Result<Arc<dyn KeyValueStore>> {
        match self {
            View::Store(store) => Ok(store),
            other => Err(other.mismatch("store")),
        }
    }

    pub fn into_map(self) -> Result<Arc<MapView>> {
        match self {
            View::Map(map) => Ok(map),
            other => Err(other.mismatch("map")),
        }
    }

    pub fn into_collection(self) -> Result<Arc<dyn CollectionView>> {
        match self {
            View::Collection(collection) => Ok(collection),
            other => Err(other.mismatch("collection")),
        }
    }

    pub fn into_subscription(self) -> Result<Arc<dyn Subscription>> {
        match self {
            View::Subscription(subscription) => Ok(subscription),
            other => Err(other.mismatch("subscription")),
        }
    }

    pub fn into_reference(self) -> Result<Arc<ReferenceView>> {
        match self {
            View::Reference(reference) => Ok(reference),
            other => Err(other.mismatch("reference")),
        }
    }

    pub fn into_publisher(self) -> Result<Arc<TopicPublisher>> {
        match self {
            View::Publisher(publisher) => Ok(publisher),
            other => Err(other.mismatch("publisher")),
        }
    }

    pub fn into_replication(self) -> Result<Arc<dyn EngineReplication>> {
        match self {
            View::Replication(replication) => Ok(replication),
            other => Err(other.mismatch("replication")),
        }
    }

    pub fn into_topology(self) -> Result<Arc<dyn TopologySubscription>> {
        match self {
            View::Topology(topology) => Ok(topology),
            other => Err(other.mismatch("topology")),
        }
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "View({})", self.view_type())
    }
}

/// The cache key of a view on its node.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ViewKey {
    pub view: ViewType,
    pub qualifier: Option<String>,
}

impl ViewKey {
    /// The key of an unqualified view.
    pub fn plain(view: ViewType) -> Self {
        ViewKey {
            view,
            qualifier: None,
        }
    }

    pub fn for_context(ctx: &RequestContext) -> Option<Self> {
        ctx.view_type().map(|view| ViewKey {
            view,
            qualifier: ctx.qualifier().map(str::to_string),
        })
    }
}

/// Builds a view directly.
pub type LeafFn = dyn Fn(&RequestContext, &Arc<Asset>) -> Result<View> + Send + Sync;

/// Builds a view around another, already acquired view.
pub type WrapFn = dyn Fn(&RequestContext, &Arc<Asset>, View) -> Result<View> + Send + Sync;

/// Where a wrapping factory finds the view it wraps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrapTarget {
    SameNode,
    Parent,
}

/// How a rule builds its view.
#[derive(Clone)]
pub enum ViewFactory {
    Leaf(Arc<LeafFn>),
    Wrapping {
        wraps: ViewType,
        target: WrapTarget,
        build: Arc<WrapFn>,
    },
}

impl ViewFactory {
    pub fn leaf<F>(build: F) -> Self
    where
        F: Fn(&RequestContext, &Arc<Asset>) -> Result<View> + Send + Sync + 'static,
    {
        ViewFactory::Leaf(Arc::new(build))
    }

    /// A factory wrapping a view of `wraps` on the same node.
    pub fn wrapping<F>(wraps: ViewType, build: F) -> Self
    where
        F: Fn(&RequestContext, &Arc<Asset>, View) -> Result<View> + Send + Sync + 'static,
    {
        ViewFactory::Wrapping {
            wraps,
            target: WrapTarget::SameNode,
            build: Arc::new(build),
        }
    }

    /// A factory wrapping a view of `wraps` on the parent node.
    pub fn wrapping_parent<F>(wraps: ViewType, build: F) -> Self
    where
        F: Fn(&RequestContext, &Arc<Asset>, View) -> Result<View> + Send + Sync + 'static,
    {
        ViewFactory::Wrapping {
            wraps,
            target: WrapTarget::Parent,
            build: Arc::new(build),
        }
    }
}

impl fmt::Debug for ViewFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewFactory::Leaf(_) => f.write_str("Leaf"),
            ViewFactory::Wrapping { wraps, target, .. } => f
                .debug_struct("Wrapping")
                .field("wraps", wraps)
                .field("target", target)
                .finish(),
        }
    }
}

/// An acquisition rule: build views of `view` with `factory`.
#[derive(Clone, Debug)]
pub struct Rule {
    pub view: ViewType,
    pub description: String,
    pub factory: ViewFactory,
}

impl Rule {
    pub fn new(view: ViewType, description: impl Into<String>, factory: ViewFactory) -> Self {
        Self {
            view,
            description: description.into(),
            factory,
        }
    }
}

/// Pick the rule for `view` from the rule lists found along a node's
/// ancestry (root first). Deeper lists win; within a list the last
/// registered rule wins.
pub fn resolve_rule<'a>(along: &[&'a Vec<Rule>], view: ViewType) -> Option<&'a Rule> {
    along
        .iter()
        .rev()
        .find_map(|rules| rules.iter().rev().find(|rule| rule.view == view))
}
