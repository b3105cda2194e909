//! The local subscription hub.
//!
//! One hub per resource node. The node's store publishes every mutation to
//! it while still holding the store lock, and the hub fans the event out to
//! each subscriber's channel. Registration with bootstrap runs inside the
//! store's snapshot callback, so the bootstrap events and the live events
//! that follow form one gap-free sequence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::{
    subscriber_channel, MapEvent, Result, SnapshotSource, Subscriber, SubscriberId,
    SubscriberSink, Subscription, SubscriptionOptions, Value,
};

struct Registered {
    sink: SubscriberSink<MapEvent>,
    null_old_value: bool,
}

#[derive(Default)]
struct HubState {
    subscribers: Vec<Registered>,
    closed: bool,
}

/// A [`Subscription`] fed by a local store.
pub struct SubscriptionHub {
    asset_name: String,
    next_id: AtomicU64,
    state: Mutex<HubState>,
    source: RwLock<Option<Weak<dyn SnapshotSource>>>,
}

impl SubscriptionHub {
    pub fn new(asset_name: impl Into<String>) -> Self {
        Self {
            asset_name: asset_name.into(),
            next_id: AtomicU64::new(1),
            state: Mutex::new(HubState::default()),
            source: RwLock::new(None),
        }
    }

    pub fn asset_name(&self) -> &str {
        &self.asset_name
    }

    fn attach(
        &self,
        options: SubscriptionOptions,
        sink: SubscriberSink<MapEvent>,
        entries: Vec<(Value, Value)>,
    ) {
        let mut state = self.state.lock();
        if state.closed {
            sink.end();
            return;
        }
        if options.bootstrap {
            for (key, value) in entries {
                sink.send(MapEvent::Inserted {
                    asset_name: self.asset_name.clone(),
                    key,
                    value,
                });
            }
        }
        if options.end_after_bootstrap {
            sink.end();
            return;
        }
        state.subscribers.push(Registered {
            sink,
            null_old_value: options.null_old_value_on_update,
        });
    }
}

impl std::fmt::Debug for SubscriptionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHub")
            .field("asset_name", &self.asset_name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[async_trait]
impl Subscription for SubscriptionHub {
    async fn register_subscriber(
        &self,
        options: SubscriptionOptions,
    ) -> Result<Subscriber<MapEvent>> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sink, subscriber) = subscriber_channel(id);
        let source = self.source.read().as_ref().and_then(Weak::upgrade);

        let mut pending = Some(sink);
        if let Some(source) = source {
            source.with_snapshot(&mut |entries| {
                if let Some(sink) = pending.take() {
                    self.attach(options, sink, entries);
                }
            });
        }
        if let Some(sink) = pending.take() {
            self.attach(options, sink, Vec::new());
        }

        tracing::debug!(asset = %self.asset_name, subscriber = %id, "registered subscriber");
        Ok(subscriber)
    }

    async fn unregister_subscriber(&self, id: SubscriberId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(position) = state.subscribers.iter().position(|r| r.sink.id() == id) {
            let registered = state.subscribers.remove(position);
            registered.sink.end();
            tracing::debug!(asset = %self.asset_name, subscriber = %id, "unregistered subscriber");
        }
        Ok(())
    }

    fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn publish(&self, event: MapEvent) {
        let mut state = self.state.lock();
        state.subscribers.retain(|registered| {
            let event = if registered.null_old_value {
                event.clone().without_old_value()
            } else {
                event.clone()
            };
            registered.sink.send(event)
        });
    }

    fn attach_source(&self, source: Weak<dyn SnapshotSource>) {
        *self.source.write() = Some(source);
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for registered in state.subscribers.drain(..) {
            registered.sink.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Delivery;
    use std::sync::Arc;

    struct FixedSource(Vec<(Value, Value)>);

    impl SnapshotSource for FixedSource {
        fn with_snapshot(&self, f: &mut dyn FnMut(Vec<(Value, Value)>)) {
            f(self.0.clone())
        }
    }

    fn inserted(key: &str, value: &str) -> MapEvent {
        MapEvent::Inserted {
            asset_name: "orders".to_string(),
            key: Value::from(key),
            value: Value::from(value),
        }
    }

    #[tokio::test]
    async fn bootstrap_then_live_events() {
        let hub = SubscriptionHub::new("orders");
        let source: Arc<dyn SnapshotSource> =
            Arc::new(FixedSource(vec![(Value::from("A"), Value::from("1"))]));
        hub.attach_source(Arc::downgrade(&source));

        let mut subscriber = hub
            .register_subscriber(SubscriptionOptions::default())
            .await
            .unwrap();
        hub.publish(inserted("B", "2"));

        assert_eq!(subscriber.next_event().await, Some(inserted("A", "1")));
        assert_eq!(subscriber.next_event().await, Some(inserted("B", "2")));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn end_after_bootstrap_does_not_stay_registered() {
        let hub = SubscriptionHub::new("orders");
        let source: Arc<dyn SnapshotSource> =
            Arc::new(FixedSource(vec![(Value::from("A"), Value::from("1"))]));
        hub.attach_source(Arc::downgrade(&source));

        let options = SubscriptionOptions {
            end_after_bootstrap: true,
            ..Default::default()
        };
        let mut subscriber = hub.register_subscriber(options).await.unwrap();
        assert_eq!(subscriber.next_event().await, Some(inserted("A", "1")));
        assert_eq!(subscriber.recv().await, Some(Delivery::EndOfSubscription));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn null_old_value_is_per_subscriber() {
        let hub = SubscriptionHub::new("orders");
        let mut plain = hub
            .register_subscriber(SubscriptionOptions::default())
            .await
            .unwrap();
        let mut stripped = hub
            .register_subscriber(SubscriptionOptions {
                null_old_value_on_update: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let update = MapEvent::Updated {
            asset_name: "orders".to_string(),
            key: Value::from("A"),
            old_value: Some(Value::from("1")),
            value: Value::from("2"),
        };
        hub.publish(update.clone());

        assert_eq!(plain.next_event().await, Some(update.clone()));
        assert_eq!(stripped.next_event().await, Some(update.without_old_value()));
    }

    #[tokio::test]
    async fn unregister_and_close_send_end() {
        let hub = SubscriptionHub::new("orders");
        let mut first = hub
            .register_subscriber(SubscriptionOptions::default())
            .await
            .unwrap();
        let mut second = hub
            .register_subscriber(SubscriptionOptions::default())
            .await
            .unwrap();

        hub.unregister_subscriber(first.id()).await.unwrap();
        assert_eq!(first.recv().await, Some(Delivery::EndOfSubscription));
        assert_eq!(hub.subscriber_count(), 1);

        hub.close();
        assert_eq!(second.recv().await, Some(Delivery::EndOfSubscription));

        let mut late = hub
            .register_subscriber(SubscriptionOptions::default())
            .await
            .unwrap();
        assert_eq!(late.recv().await, Some(Delivery::EndOfSubscription));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned_on_publish() {
        let hub = SubscriptionHub::new("orders");
        let subscriber = hub
            .register_subscriber(SubscriptionOptions::default())
            .await
            .unwrap();
        drop(subscriber);
        hub.publish(inserted("A", "1"));
        assert_eq!(hub.subscriber_count(), 0);
    }
}
