//! Reference and publisher views.
//!
//! A reference at `parent/key` is a view of the single entry `key` of the
//! parent node's map. A publisher treats its map as a set of topics, each
//! holding its latest message. Both are thin layers over [`MapView`];
//! their subscribers are fed by a task that filters the map's events.

use std::sync::Arc;

use crate::{
    subscriber_channel, Delivery, FunctionRegistry, MapEvent, MapFunction, MapView, Result,
    Subscriber, Value,
};

/// A view of one key of the parent map.
pub struct ReferenceView {
    key: Value,
    map: Arc<MapView>,
    functions: Arc<FunctionRegistry>,
}

impl ReferenceView {
    pub fn new(key: Value, map: Arc<MapView>, functions: Arc<FunctionRegistry>) -> Self {
        Self {
            key,
            map,
            functions,
        }
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub async fn get(&self) -> Result<Option<Value>> {
        self.map.get(&self.key).await
    }

    pub async fn set(&self, value: Value) -> Result<()> {
        self.map.check_value(&value)?;
        self.map.store().put(self.key.clone(), value).await
    }

    pub async fn remove(&self) -> Result<()> {
        self.map.store().remove(&self.key).await
    }

    pub async fn get_and_set(&self, value: Value) -> Result<Option<Value>> {
        self.map.check_value(&value)?;
        self.map.store().get_and_put(self.key.clone(), value).await
    }

    pub async fn get_and_remove(&self) -> Result<Option<Value>> {
        self.map.store().get_and_remove(&self.key).await
    }

    /// Evaluate the named key function against the current value without
    /// storing the result.
    pub async fn apply(&self, function: &str, arg: Value) -> Result<Option<Value>> {
        let function = self.functions.key_function(function)?;
        let current = self.get().await?;
        function(&self.key, current.as_ref(), &arg)
    }

    /// Replace the value with the result of the named key function,
    /// atomically. A `None` result removes the key.
    pub async fn update(&self, function: &str, arg: Value) -> Result<Option<Value>> {
        let result = self
            .map
            .apply_to(
                &MapFunction::Compute(function.to_string()),
                Value::Array(vec![self.key.clone(), arg]),
            )
            .await?;
        Ok(result.into_option())
    }

    /// Receive the key's values as they change. A removal is delivered as
    /// [`Value::Null`].
    pub async fn register_subscriber(&self, bootstrap: bool) -> Result<Subscriber<Value>> {
        let mut upstream = self.map.register_subscriber(bootstrap, false).await?;
        let (sink, subscriber) = subscriber_channel(upstream.id());
        let key = self.key.clone();
        tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Some(Delivery::Event(event)) if *event.key() == key => {
                        let value = event.value().cloned().unwrap_or(Value::Null);
                        if !sink.send(value) {
                            break;
                        }
                    }
                    Some(Delivery::Event(_)) => {
                        if sink.is_closed() {
                            break;
                        }
                    }
                    Some(Delivery::EndOfSubscription) | None => {
                        sink.end();
                        break;
                    }
                }
            }
        });
        Ok(subscriber)
    }
}

impl std::fmt::Debug for ReferenceView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceView")
            .field("key", &self.key)
            .field("map", &self.map)
            .finish()
    }
}

/// Publishes messages to topics of a map.
#[derive(Debug)]
pub struct TopicPublisher {
    map: Arc<MapView>,
}

impl TopicPublisher {
    pub fn new(map: Arc<MapView>) -> Self {
        Self { map }
    }

    pub async fn publish(&self, topic: Value, message: Value) -> Result<()> {
        self.map.put(topic, message).await.map(|_| ())
    }

    /// Receive `(topic, message)` pairs. Topic removals are not delivered.
    pub async fn register_topic_subscriber(
        &self,
        bootstrap: bool,
    ) -> Result<Subscriber<(Value, Value)>> {
        let mut upstream = self.map.register_subscriber(bootstrap, false).await?;
        let (sink, subscriber) = subscriber_channel(upstream.id());
        tokio::spawn(async move {
            while let Some(delivery) = upstream.recv().await {
                match delivery {
                    Delivery::Event(MapEvent::Inserted { key, value, .. })
                    | Delivery::Event(MapEvent::Updated { key, value, .. }) => {
                        if !sink.send((key, value)) {
                            return;
                        }
                    }
                    Delivery::Event(MapEvent::Removed { .. }) => {}
                    Delivery::EndOfSubscription => break,
                }
            }
            sink.end();
        });
        Ok(subscriber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AssetTree;

    fn s(v: &str) -> Value {
        Value::from(v)
    }

    #[tokio::test]
    async fn reference_reads_and_writes_parent_entry() {
        let tree = AssetTree::for_testing();
        let reference = tree.acquire_reference("/config/timeout").unwrap();
        assert_eq!(reference.key(), &s("timeout"));
        assert_eq!(reference.get().await.unwrap(), None);

        reference.set(s("5")).await.unwrap();
        let parent = tree.acquire_map("/config").unwrap();
        assert_eq!(parent.get(&s("timeout")).await.unwrap(), Some(s("5")));

        assert_eq!(reference.get_and_set(s("7")).await.unwrap(), Some(s("5")));
        assert_eq!(
            reference.apply("upper_case", Value::Null).await.unwrap(),
            Some(s("7"))
        );
        assert_eq!(reference.get_and_remove().await.unwrap(), Some(s("7")));
        assert_eq!(parent.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reference_update_is_atomic_compute() {
        let tree = AssetTree::for_testing();
        let reference = tree
            .acquire_reference("/stats/hits?valueType=Long")
            .unwrap();
        reference.update("increment", Value::Integer(2)).await.unwrap();
        assert_eq!(
            reference.update("increment", Value::Integer(3)).await.unwrap(),
            Some(Value::Integer(5))
        );
    }

    #[tokio::test]
    async fn reference_subscriber_sees_only_its_key() {
        let tree = AssetTree::for_testing();
        let parent = tree.acquire_map("/config").unwrap();
        parent.put(s("timeout"), s("1")).await.unwrap();
        parent.put(s("other"), s("x")).await.unwrap();

        let reference = tree.acquire_reference("/config/timeout").unwrap();
        let mut subscriber = reference.register_subscriber(true).await.unwrap();
        parent.put(s("other"), s("y")).await.unwrap();
        parent.put(s("timeout"), s("2")).await.unwrap();
        parent.remove(&s("timeout")).await.unwrap();

        assert_eq!(subscriber.next_event().await, Some(s("1")));
        assert_eq!(subscriber.next_event().await, Some(s("2")));
        assert_eq!(subscriber.next_event().await, Some(Value::Null));
    }

    #[tokio::test]
    async fn publisher_delivers_topic_message_pairs() {
        let tree = AssetTree::for_testing();
        let publisher = tree.acquire_publisher("/news").unwrap();
        publisher.publish(s("sport"), s("goal")).await.unwrap();

        let mut subscriber = publisher.register_topic_subscriber(true).await.unwrap();
        publisher.publish(s("weather"), s("rain")).await.unwrap();

        assert_eq!(subscriber.next_event().await, Some((s("sport"), s("goal"))));
        assert_eq!(subscriber.next_event().await, Some((s("weather"), s("rain"))));

        tree.close();
        assert_eq!(subscriber.next_event().await, None);
    }
}
