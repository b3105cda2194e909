//! Topology subscriptions: watching nodes appear below a node.
//!
//! Every node can carry a topology view. [`Asset::acquire_child`] publishes
//! an [`TopologyEvent::Added`] event to its node's topology view while it
//! still holds the lock on the children, and registration with bootstrap
//! reads the existing children under the same lock, so a subscriber sees
//! every child exactly once.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    subscriber_channel, Asset, Error, Result, Subscriber, SubscriberId, SubscriberSink, Value,
};

/// A change to the children of one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A child that was already there when the subscriber registered.
    Existing { asset_name: String, name: String },
    /// A child created after the subscriber registered.
    Added { asset_name: String, name: String },
}

impl TopologyEvent {
    /// The full name of the node whose children changed.
    pub fn asset_name(&self) -> &str {
        match self {
            TopologyEvent::Existing { asset_name, .. }
            | TopologyEvent::Added { asset_name, .. } => asset_name,
        }
    }

    /// The child's name.
    pub fn name(&self) -> &str {
        match self {
            TopologyEvent::Existing { name, .. } | TopologyEvent::Added { name, .. } => name,
        }
    }

    pub fn to_value(&self) -> Value {
        let kind = match self {
            TopologyEvent::Existing { .. } => "existingAsset",
            TopologyEvent::Added { .. } => "addedAsset",
        };
        let mut fields = BTreeMap::new();
        fields.insert("type".to_string(), Value::from(kind));
        fields.insert("assetName".to_string(), Value::from(self.asset_name()));
        fields.insert("name".to_string(), Value::from(self.name()));
        Value::Map(fields)
    }

    /// Decode the form produced by [`TopologyEvent::to_value`].
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Map(mut fields) = value else {
            return Err(Error::protocol("topology event must be a map"));
        };
        let mut text = |name: &str| {
            fields
                .remove(name)
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| Error::protocol(format!("topology event needs a '{}' string", name)))
        };
        let kind = text("type")?;
        let asset_name = text("assetName")?;
        let name = text("name")?;
        match kind.as_str() {
            "existingAsset" => Ok(TopologyEvent::Existing { asset_name, name }),
            "addedAsset" => Ok(TopologyEvent::Added { asset_name, name }),
            other => Err(Error::protocol(format!("unknown topology event type {}", other))),
        }
    }
}

impl fmt::Display for TopologyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyEvent::Existing { asset_name, name } => {
                write!(f, "existing {}/{}", asset_name, name)
            }
            TopologyEvent::Added { asset_name, name } => write!(f, "added {}/{}", asset_name, name),
        }
    }
}

/// A source of topology events for one node.
#[async_trait]
pub trait TopologySubscription: Send + Sync {
    /// Register a subscriber. With `bootstrap` set it first receives an
    /// [`TopologyEvent::Existing`] event per current child.
    async fn register_subscriber(&self, bootstrap: bool) -> Result<Subscriber<TopologyEvent>>;

    async fn unregister_subscriber(&self, id: SubscriberId) -> Result<()>;

    fn subscriber_count(&self) -> usize;

    /// Announce a new child. Only meaningful for local subscriptions.
    fn child_added(&self, _name: &str) {}

    /// End every subscriber and refuse new ones.
    fn close(&self);
}

#[derive(Default)]
struct TopologyState {
    subscribers: Vec<SubscriberSink<TopologyEvent>>,
    closed: bool,
}

/// The [`TopologySubscription`] of a local node.
pub struct TopologyHub {
    asset_name: String,
    asset: Weak<Asset>,
    next_id: AtomicU64,
    state: Mutex<TopologyState>,
}

impl TopologyHub {
    pub fn new(asset_name: impl Into<String>, asset: Weak<Asset>) -> Self {
        Self {
            asset_name: asset_name.into(),
            asset,
            next_id: AtomicU64::new(1),
            state: Mutex::new(TopologyState::default()),
        }
    }

    fn attach(&self, bootstrap: bool, sink: SubscriberSink<TopologyEvent>, children: Vec<String>) {
        let mut state = self.state.lock();
        if state.closed {
            sink.end();
            return;
        }
        if bootstrap {
            for name in children {
                sink.send(TopologyEvent::Existing {
                    asset_name: self.asset_name.clone(),
                    name,
                });
            }
        }
        state.subscribers.push(sink);
    }
}

impl fmt::Debug for TopologyHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyHub")
            .field("asset_name", &self.asset_name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[async_trait]
impl TopologySubscription for TopologyHub {
    async fn register_subscriber(&self, bootstrap: bool) -> Result<Subscriber<TopologyEvent>> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sink, subscriber) = subscriber_channel(id);
        match self.asset.upgrade() {
            Some(asset) => asset.with_child_names(|names| self.attach(bootstrap, sink, names)),
            None => self.attach(bootstrap, sink, Vec::new()),
        }
        tracing::debug!(
            asset = %self.asset_name,
            subscriber = %id,
            "registered topology subscriber"
        );
        Ok(subscriber)
    }

    async fn unregister_subscriber(&self, id: SubscriberId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(position) = state.subscribers.iter().position(|sink| sink.id() == id) {
            state.subscribers.remove(position).end();
        }
        Ok(())
    }

    fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn child_added(&self, name: &str) {
        let event = TopologyEvent::Added {
            asset_name: self.asset_name.clone(),
            name: name.to_string(),
        };
        self.state
            .lock()
            .subscribers
            .retain(|sink| sink.send(event.clone()));
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for sink in state.subscribers.drain(..) {
            sink.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AssetTree, Delivery};

    fn added(asset_name: &str, name: &str) -> TopologyEvent {
        TopologyEvent::Added {
            asset_name: asset_name.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn existing_children_then_new_ones() {
        let tree = AssetTree::for_testing();
        tree.acquire_map("/markets/london").unwrap();

        let mut subscriber = tree
            .register_topology_subscriber("/markets?bootstrap=true")
            .await
            .unwrap();
        assert_eq!(
            subscriber.next_event().await,
            Some(TopologyEvent::Existing {
                asset_name: "markets".to_string(),
                name: "london".to_string(),
            })
        );

        tree.acquire_map("/markets/tokyo").unwrap();
        // acquiring an existing node announces nothing
        tree.acquire_map("/markets/london").unwrap();
        tree.acquire_map("/markets/paris/bourse").unwrap();
        assert_eq!(subscriber.next_event().await, Some(added("markets", "tokyo")));
        assert_eq!(subscriber.next_event().await, Some(added("markets", "paris")));
    }

    #[tokio::test]
    async fn grandchildren_are_announced_to_their_own_parent() {
        let tree = AssetTree::for_testing();
        let mut top = tree
            .register_topology_subscriber("/markets?bootstrap=false")
            .await
            .unwrap();
        let mut below = tree
            .register_topology_subscriber("/markets/paris?bootstrap=false")
            .await
            .unwrap();

        tree.acquire_map("/markets/paris/bourse").unwrap();
        assert_eq!(below.next_event().await, Some(added("markets/paris", "bourse")));

        tree.acquire_map("/markets/rome").unwrap();
        assert_eq!(top.next_event().await, Some(added("markets", "rome")));
    }

    #[tokio::test]
    async fn unregister_and_close_end_subscribers() {
        let tree = AssetTree::for_testing();
        let topology = tree.acquire_topology("/markets").unwrap();
        let mut first = topology.register_subscriber(false).await.unwrap();
        let mut second = topology.register_subscriber(false).await.unwrap();
        assert_eq!(topology.subscriber_count(), 2);

        tree.unregister_subscriber("/markets?view=topology", first.id())
            .await
            .unwrap();
        assert_eq!(first.recv().await, Some(Delivery::EndOfSubscription));
        assert_eq!(topology.subscriber_count(), 1);

        tree.close();
        assert_eq!(second.recv().await, Some(Delivery::EndOfSubscription));
    }

    #[test]
    fn events_cross_the_wire_as_maps() {
        let event = added("markets", "tokyo");
        assert_eq!(TopologyEvent::from_value(event.to_value()).unwrap(), event);
        assert!(TopologyEvent::from_value(Value::from("tokyo")).is_err());
        assert_eq!(event.to_string(), "added markets/tokyo");
    }
}
