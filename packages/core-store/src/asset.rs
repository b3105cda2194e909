//! Resource nodes.
//!
//! An [`Asset`] is one node of the resource tree. It owns its children,
//! points weakly at its parent and caches the views built for it, at most
//! one per capability and qualifier. Construction of a missing view runs
//! under the node's reentrant construction lock: concurrent first access
//! builds the view once, while a factory may still acquire another view of
//! the same node from inside its own construction.
//!
//! Creating a child announces it on the node's topology view, if one has
//! been built.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, RwLock};

use crate::view::{resolve_rule, Rule, ViewFactory, ViewKey, WrapTarget};
use crate::{
    Error, FunctionRegistry, HostId, Path, PathTrie, RequestContext, Result, TypeRegistry, View,
    ViewType,
};

/// An authorization hook run before a view is acquired.
pub type AccessCheck = dyn Fn(&RequestContext) -> Result<()> + Send + Sync;

/// State shared by every node of one tree.
pub(crate) struct TreeShared {
    pub(crate) rules: RwLock<PathTrie<Vec<Rule>>>,
    pub(crate) types: Arc<TypeRegistry>,
    pub(crate) functions: Arc<FunctionRegistry>,
    pub(crate) host_id: HostId,
    pub(crate) access_checks: RwLock<Vec<Arc<AccessCheck>>>,
}

impl TreeShared {
    fn resolve(&self, path: &Path, view: crate::ViewType) -> Option<Rule> {
        let rules = self.rules.read();
        let along = rules.along(path);
        resolve_rule(&along, view).cloned()
    }
}

/// A node of the resource tree.
pub struct Asset {
    path: Path,
    parent: Option<Weak<Asset>>,
    children: RwLock<BTreeMap<String, Arc<Asset>>>,
    views: RwLock<HashMap<ViewKey, View>>,
    construction: ReentrantMutex<()>,
    shared: Arc<TreeShared>,
}

impl Asset {
    pub(crate) fn root(shared: Arc<TreeShared>) -> Arc<Self> {
        Arc::new(Self {
            path: Path::root(),
            parent: None,
            children: RwLock::new(BTreeMap::new()),
            views: RwLock::new(HashMap::new()),
            construction: ReentrantMutex::new(()),
            shared,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The leaf name, empty for the root.
    pub fn name(&self) -> &str {
        self.path.name().unwrap_or("")
    }

    pub fn parent(&self) -> Option<Arc<Asset>> {
        self.parent.as_ref().and_then(Weak::upgrade)
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

    pub fn get_child(&self, name: &str) -> Option<Arc<Asset>> {
        self.children.read().get(name).cloned()
    }

    /// The named child, created if missing.
    pub fn acquire_child(self: &Arc<Self>, name: &str) -> Result<Arc<Asset>> {
        if let Some(child) = self.get_child(name) {
            return Ok(child);
        }
        let path = self.path.child(name)?;
        let mut children = self.children.write();
        if let Some(child) = children.get(name) {
            return Ok(child.clone());
        }
        let child = Arc::new(Asset {
            path,
            parent: Some(Arc::downgrade(self)),
            children: RwLock::new(BTreeMap::new()),
            views: RwLock::new(HashMap::new()),
            construction: ReentrantMutex::new(()),
            shared: self.shared.clone(),
        });
        children.insert(name.to_string(), child.clone());
        // announced under the children lock, so bootstrap cannot miss it
        let topology = self.get_view(&ViewKey::plain(ViewType::Topology));
        if let Some(View::Topology(topology)) = topology {
            topology.child_added(name);
        }
        Ok(child)
    }

    /// Call `f` with the names of the current children while no child can
    /// be added.
    pub(crate) fn with_child_names<R>(&self, f: impl FnOnce(Vec<String>) -> R) -> R {
        let children = self.children.read();
        f(children.keys().cloned().collect())
    }

    pub fn children(&self) -> Vec<Arc<Asset>> {
        self.children.read().values().cloned().collect()
    }

    /// Register a rule on this node. It applies here and to every
    /// descendant that has no closer rule for the same view.
    pub fn add_rule(&self, rule: Rule) {
        tracing::debug!(
            path = %self.path,
            view = %rule.view,
            rule = %rule.description,
            "adding rule"
        );
        self.shared
            .rules
            .write()
            .get_or_insert_with(&self.path, Vec::new)
            .push(rule);
    }

    /// The cached view for `key`, if one was built.
    pub fn get_view(&self, key: &ViewKey) -> Option<View> {
        self.views.read().get(key).cloned()
    }

    /// Return the view `ctx` asks for, building it on first use.
    pub fn acquire_view(self: &Arc<Self>, ctx: &RequestContext) -> Result<View> {
        let key = ViewKey::for_context(ctx).ok_or_else(|| {
            Error::invalid_argument(format!("no view requested for {}", ctx.path()))
        })?;
        for check in self.shared.access_checks.read().iter() {
            check(ctx)?;
        }
        if let Some(view) = self.get_view(&key) {
            return Ok(view);
        }

        let _construction = self.construction.lock();
        if let Some(view) = self.get_view(&key) {
            return Ok(view);
        }

        let rule = self.shared.resolve(&self.path, key.view).ok_or_else(|| {
            Error::not_found(format!("no rule for {} view of /{}", key.view, self.path))
        })?;
        let ctx = ctx.for_path(self.path.clone());
        let view = match &rule.factory {
            ViewFactory::Leaf(build) => build(&ctx, self)?,
            ViewFactory::Wrapping {
                wraps,
                target,
                build,
            } => {
                let owner = match target {
                    WrapTarget::SameNode => self.clone(),
                    WrapTarget::Parent => self.parent().ok_or_else(|| {
                        Error::not_found(format!("/{} has no parent to wrap", self.path))
                    })?,
                };
                let inner_ctx = ctx.for_path(owner.path.clone()).for_view(*wraps);
                let inner = owner.acquire_view(&inner_ctx)?;
                build(&ctx, self, inner)?
            }
        };

        tracing::debug!(
            path = %self.path,
            view = %key.view,
            rule = %rule.description,
            "built view"
        );
        self.views.write().insert(key, view.clone());
        Ok(view)
    }

    /// Drop every cached view of this node and its descendants, ending
    /// their subscriptions.
    pub(crate) fn close(&self) {
        let views: Vec<View> = self.views.write().drain().map(|(_, view)| view).collect();
        for view in views {
            match view {
                View::Subscription(subscription) => subscription.close(),
                View::Topology(topology) => topology.close(),
                _ => {}
            }
        }
        for child in self.children() {
            child.close();
        }
    }
}

impl std::fmt::Debug for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let views: Vec<_> = self.views.read().keys().map(|k| k.view).collect();
        f.debug_struct("Asset")
            .field("path", &self.path)
            .field("views", &views)
            .finish_non_exhaustive()
    }
}
