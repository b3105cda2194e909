use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kvtree_core_store::{
    subscriber_channel, Error, MapEvent, RequestContext, Result, Subscriber, SubscriberId,
    SubscriberSink, Subscription, SubscriptionOptions, Value,
};
use kvtree_wire::{param, Body, Connection, Listener, SubscriptionOp};
use parking_lot::Mutex;

/// Map events from another host.
///
/// Each subscriber is one `registerSubscriber` request; its events arrive
/// as pushes on the request's tid and the subscriber id is that tid.
pub struct RemoteSubscription {
    connection: Connection,
    base: RequestContext,
    /// Live subscribers by tid, with the csp they registered on.
    registered: Arc<Mutex<HashMap<i64, String>>>,
}

impl RemoteSubscription {
    /// A subscription to the map `ctx` addresses.
    pub fn new(connection: Connection, ctx: &RequestContext) -> Result<Self> {
        // an unsealed copy, so options can be set per subscriber
        let base = RequestContext::parse(&ctx.to_uri())?;
        Ok(Self {
            connection,
            base,
            registered: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn csp_for(&self, options: &SubscriptionOptions) -> Result<String> {
        let mut ctx = self.base.clone();
        ctx.set_bootstrap(options.bootstrap)?
            .set_end_subscription_after_bootstrap(options.end_after_bootstrap)?;
        Ok(ctx.to_uri())
    }
}

/// Feed pushes for one tid into a local subscriber until the server ends
/// it or the connection goes away.
async fn pump(
    tid: i64,
    mut listener: Listener,
    sink: SubscriberSink<MapEvent>,
    null_old_value: bool,
    registered: Arc<Mutex<HashMap<i64, String>>>,
) {
    while let Some(body) = listener.recv().await {
        match body {
            Body::Event { name, params } if name == SubscriptionOp::OnEvent.as_str() => {
                let event = param(&params, 0, "event").and_then(MapEvent::from_value);
                match event {
                    Ok(event) => {
                        let event = if null_old_value {
                            event.without_old_value()
                        } else {
                            event
                        };
                        if !sink.send(event) {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(tid, error = %e, "dropping malformed event"),
                }
            }
            Body::Event { name, .. } if name == SubscriptionOp::OnEndOfSubscription.as_str() => {
                break;
            }
            Body::Exception { kind, message } => {
                let e = Error::from_reply(kind, message);
                tracing::warn!(tid, error = %e, "subscription refused");
                break;
            }
            other => tracing::debug!(tid, ?other, "unexpected subscription push"),
        }
    }
    sink.end();
    registered.lock().remove(&tid);
}

#[async_trait]
impl Subscription for RemoteSubscription {
    async fn register_subscriber(
        &self,
        options: SubscriptionOptions,
    ) -> Result<Subscriber<MapEvent>> {
        let csp = self.csp_for(&options)?;
        let (tid, listener) = self
            .connection
            .subscribe(&csp, SubscriptionOp::RegisterSubscriber.as_str(), vec![])
            .await?;
        self.registered.lock().insert(tid, csp.clone());

        let (sink, subscriber) = subscriber_channel(SubscriberId(tid as u64));
        tokio::spawn(pump(
            tid,
            listener,
            sink,
            options.null_old_value_on_update,
            self.registered.clone(),
        ));
        tracing::debug!(%csp, tid, "registered remote subscriber");
        Ok(subscriber)
    }

    async fn unregister_subscriber(&self, id: SubscriberId) -> Result<()> {
        let tid = id.0 as i64;
        let csp = self.registered.lock().get(&tid).cloned();
        match csp {
            // the end notice arrives on the tid and ends the subscriber
            Some(csp) => self
                .connection
                .call(
                    &csp,
                    None,
                    SubscriptionOp::UnregisterSubscriber.as_str(),
                    vec![Value::Integer(tid)],
                )
                .await
                .map(|_| ()),
            None => Ok(()),
        }
    }

    fn subscriber_count(&self) -> usize {
        self.registered.lock().len()
    }

    /// End every subscriber and tell the server to drop their
    /// registrations. Nothing waits for the server's answers.
    fn close(&self) {
        let registered: Vec<(i64, String)> = self.registered.lock().drain().collect();
        if registered.is_empty() {
            return;
        }
        for (tid, _) in &registered {
            self.connection.unsubscribe(*tid);
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(subscribers = registered.len(), "no runtime, not unregistering");
            return;
        };
        let connection = self.connection.clone();
        runtime.spawn(async move {
            for (tid, csp) in registered {
                let notice = connection
                    .send(
                        &csp,
                        None,
                        SubscriptionOp::UnregisterSubscriber.as_str(),
                        vec![Value::Integer(tid)],
                    )
                    .await;
                if let Err(e) = notice {
                    tracing::debug!(tid, error = %e, "could not unregister remote subscriber");
                    break;
                }
            }
        });
    }
}

impl std::fmt::Debug for RemoteSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSubscription")
            .field("csp", &self.base.to_uri())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::served;
    use kvtree_core_store::KeyValueStore;
    use std::time::Duration;

    fn s(v: &str) -> Value {
        Value::from(v)
    }

    fn options(bootstrap: bool, end_after_bootstrap: bool) -> SubscriptionOptions {
        SubscriptionOptions {
            bootstrap,
            end_after_bootstrap,
            null_old_value_on_update: false,
        }
    }

    #[tokio::test]
    async fn bootstrap_then_live_events() {
        let (server, conn) = served();
        let local = server.tree().acquire_store("/orders").unwrap();
        local.put(s("A"), s("1")).await.unwrap();

        let ctx = RequestContext::parse("/orders?view=subscription").unwrap();
        let subscription = RemoteSubscription::new(conn, &ctx).unwrap();
        let mut subscriber = subscription
            .register_subscriber(options(true, false))
            .await
            .unwrap();

        let first = subscriber.next_event().await.unwrap();
        assert!(matches!(first, MapEvent::Inserted { ref key, .. } if *key == s("A")));

        local.put(s("A"), s("2")).await.unwrap();
        let second = subscriber.next_event().await.unwrap();
        assert!(matches!(second, MapEvent::Updated { ref value, .. } if *value == s("2")));
        assert_eq!(subscription.subscriber_count(), 1);

        subscription
            .unregister_subscriber(subscriber.id())
            .await
            .unwrap();
        assert!(subscriber.next_event().await.is_none());
    }

    #[tokio::test]
    async fn end_after_bootstrap() {
        let (server, conn) = served();
        let local = server.tree().acquire_store("/orders").unwrap();
        local.put(s("A"), s("1")).await.unwrap();
        local.put(s("B"), s("2")).await.unwrap();

        let ctx = RequestContext::parse("/orders?view=subscription").unwrap();
        let subscription = RemoteSubscription::new(conn, &ctx).unwrap();
        let mut subscriber = subscription
            .register_subscriber(options(true, true))
            .await
            .unwrap();

        assert!(subscriber.next_event().await.is_some());
        assert!(subscriber.next_event().await.is_some());
        assert!(subscriber.next_event().await.is_none());
    }

    #[tokio::test]
    async fn closing_the_connection_ends_subscribers() {
        let (_server, conn) = served();
        let ctx = RequestContext::parse("/orders?view=subscription").unwrap();
        let subscription = RemoteSubscription::new(conn.clone(), &ctx).unwrap();
        let mut subscriber = subscription
            .register_subscriber(options(false, false))
            .await
            .unwrap();

        conn.close().await;
        assert!(subscriber.next_event().await.is_none());
    }

    #[tokio::test]
    async fn unregistering_unknown_subscriber_is_a_no_op() {
        let (_server, conn) = served();
        let ctx = RequestContext::parse("/orders?view=subscription").unwrap();
        let subscription = RemoteSubscription::new(conn, &ctx).unwrap();
        subscription
            .unregister_subscriber(SubscriberId(999))
            .await
            .unwrap();
    }

    async fn settles(what: &str, check: impl Fn() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn close_releases_server_registrations() {
        let (server, conn) = served();
        let hub = server.tree().acquire_subscription("/orders").unwrap();
        let ctx = RequestContext::parse("/orders?view=subscription").unwrap();
        let subscription = RemoteSubscription::new(conn.clone(), &ctx).unwrap();
        let mut first = subscription
            .register_subscriber(options(false, false))
            .await
            .unwrap();
        let mut second = subscription
            .register_subscriber(options(true, false))
            .await
            .unwrap();
        settles("both registrations", || hub.subscriber_count() == 2).await;

        subscription.close();
        assert_eq!(subscription.subscriber_count(), 0);
        assert!(first.next_event().await.is_none());
        assert!(second.next_event().await.is_none());
        settles("the server to drop them", || hub.subscriber_count() == 0).await;
        assert!(!conn.is_closed());
    }
}
