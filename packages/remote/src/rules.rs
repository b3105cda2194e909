use std::sync::Arc;

use kvtree_core_store::{install_layered_rules, AssetTree, Rule, View, ViewFactory, ViewType};
use kvtree_wire::Connection;

use crate::{RemoteKeyValueStore, RemoteSubscription, RemoteTopology};

/// Make every store, subscription and topology view in `tree` a proxy over
/// `connection`.
///
/// The map, collection, reference and publisher views are layered on the
/// proxies exactly as on local stores, so they work against the remote host
/// unchanged. Replication is not available through a proxy.
pub fn install_remote_rules(tree: &AssetTree, connection: Connection) {
    let root = tree.root();

    let for_subscriptions = connection.clone();
    root.add_rule(Rule::new(
        ViewType::Subscription,
        "remote subscription",
        ViewFactory::leaf(move |ctx, _| {
            let subscription = RemoteSubscription::new(for_subscriptions.clone(), ctx)?;
            Ok(View::Subscription(Arc::new(subscription)))
        }),
    ));
    let for_topology = connection.clone();
    root.add_rule(Rule::new(
        ViewType::Topology,
        "remote topology",
        ViewFactory::leaf(move |ctx, _| {
            let topology = RemoteTopology::new(for_topology.clone(), ctx)?;
            Ok(View::Topology(Arc::new(topology)))
        }),
    ));
    root.add_rule(Rule::new(
        ViewType::Store,
        "remote store",
        ViewFactory::leaf(move |ctx, _| {
            let store = RemoteKeyValueStore::new(connection.clone(), ctx.to_uri());
            Ok(View::Store(Arc::new(store)))
        }),
    ));
    install_layered_rules(root);
}
