use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kvtree_core_store::{
    subscriber_channel, Error, RequestContext, Result, Subscriber, SubscriberId, SubscriberSink,
    TopologyEvent, TopologySubscription, Value, ViewType,
};
use kvtree_wire::{param, Body, Connection, Listener, SubscriptionOp};
use parking_lot::Mutex;

/// Children appearing below a node of another host.
///
/// Registration and cancellation use the same requests as map
/// subscriptions, addressed to the node's topology view.
pub struct RemoteTopology {
    connection: Connection,
    base: RequestContext,
    registered: Arc<Mutex<HashMap<i64, String>>>,
}

impl RemoteTopology {
    pub fn new(connection: Connection, ctx: &RequestContext) -> Result<Self> {
        let mut base = RequestContext::parse(&ctx.to_uri())?;
        base.set_view_type(ViewType::Topology)?;
        Ok(Self {
            connection,
            base,
            registered: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

async fn pump(
    tid: i64,
    mut listener: Listener,
    sink: SubscriberSink<TopologyEvent>,
    registered: Arc<Mutex<HashMap<i64, String>>>,
) {
    while let Some(body) = listener.recv().await {
        match body {
            Body::Event { name, params } if name == SubscriptionOp::OnEvent.as_str() => {
                match param(&params, 0, "event").and_then(TopologyEvent::from_value) {
                    Ok(event) => {
                        if !sink.send(event) {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(tid, error = %e, "dropping malformed topology event"),
                }
            }
            Body::Event { name, .. } if name == SubscriptionOp::OnEndOfSubscription.as_str() => {
                break;
            }
            Body::Exception { kind, message } => {
                let e = Error::from_reply(kind, message);
                tracing::warn!(tid, error = %e, "topology subscription refused");
                break;
            }
            other => tracing::debug!(tid, ?other, "unexpected topology push"),
        }
    }
    sink.end();
    registered.lock().remove(&tid);
}

#[async_trait]
impl TopologySubscription for RemoteTopology {
    async fn register_subscriber(&self, bootstrap: bool) -> Result<Subscriber<TopologyEvent>> {
        let mut ctx = self.base.clone();
        ctx.set_bootstrap(bootstrap)?;
        let csp = ctx.to_uri();
        let (tid, listener) = self
            .connection
            .subscribe(&csp, SubscriptionOp::RegisterSubscriber.as_str(), vec![])
            .await?;
        self.registered.lock().insert(tid, csp);

        let (sink, subscriber) = subscriber_channel(SubscriberId(tid as u64));
        tokio::spawn(pump(tid, listener, sink, self.registered.clone()));
        Ok(subscriber)
    }

    async fn unregister_subscriber(&self, id: SubscriberId) -> Result<()> {
        let tid = id.0 as i64;
        let csp = self.registered.lock().get(&tid).cloned();
        let Some(csp) = csp else {
            return Ok(());
        };
        self.connection
            .call(
                &csp,
                None,
                SubscriptionOp::UnregisterSubscriber.as_str(),
                vec![Value::Integer(tid)],
            )
            .await
            .map(|_| ())
    }

    fn subscriber_count(&self) -> usize {
        self.registered.lock().len()
    }

    fn close(&self) {
        let tids: Vec<i64> = self.registered.lock().drain().map(|(tid, _)| tid).collect();
        for tid in tids {
            self.connection.unsubscribe(tid);
        }
    }
}

impl std::fmt::Debug for RemoteTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTopology")
            .field("csp", &self.base.to_uri())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
