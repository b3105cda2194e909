use std::time::Duration;

use kvtree::{
    Client, ClientConfig, CollectionKind, Config, Connection, ConnectionOptions, Error,
    ErrorKind, KeyValueStore, MapEvent, Node, RemoteKeyValueStore, TopologyEvent, Value,
    WireType,
};
use kvtree_wire::Handle;
use tokio::net::TcpListener;

fn s(v: &str) -> Value {
    Value::from(v)
}

fn config(wire: WireType) -> Config {
    let mut config = Config::default();
    config.client.wire = wire;
    config.server.wire = wire;
    config
}

async fn orders_scenario(wire: WireType) {
    let config = config(wire);
    let node = Node::start(&config).await.unwrap();
    let client = Client::connect(node.local_addr().unwrap(), &config.client)
        .await
        .unwrap();

    let orders = client
        .tree()
        .acquire_map("/orders?keyType=String&valueType=Long")
        .unwrap();
    let mut subscriber = client
        .tree()
        .register_subscriber("/orders?view=subscription&bootstrap=true")
        .await
        .unwrap();

    assert_eq!(orders.put(s("A"), Value::Integer(1)).await.unwrap(), None);
    assert_eq!(
        orders.put(s("A"), Value::Integer(2)).await.unwrap(),
        Some(Value::Integer(1))
    );
    assert!(matches!(
        subscriber.next_event().await.unwrap(),
        MapEvent::Inserted { key, value, .. } if key == s("A") && value == Value::Integer(1)
    ));
    assert!(matches!(
        subscriber.next_event().await.unwrap(),
        MapEvent::Updated { old_value, value, .. }
            if old_value == Some(Value::Integer(1)) && value == Value::Integer(2)
    ));
    assert_eq!(orders.get(&s("A")).await.unwrap(), Some(Value::Integer(2)));
    orders.put(s("B"), Value::Integer(3)).await.unwrap();
    assert_eq!(orders.size().await.unwrap(), 2);

    let local = node.tree().acquire_map("/orders").unwrap();
    assert_eq!(local.get(&s("A")).await.unwrap(), Some(Value::Integer(2)));
    assert!(orders.content_equals(&local).await.unwrap());
    assert_eq!(orders.hash_code().await.unwrap(), local.hash_code().await.unwrap());

    let keys = orders.key_set().await.unwrap();
    assert_eq!(keys.to_vec().await.unwrap(), vec![s("A"), s("B")]);
    assert!(keys.remove(&s("A")).await.unwrap());
    assert_eq!(local.size().await.unwrap(), 1);

    client.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn orders_over_binary_wire() {
    orders_scenario(WireType::Binary).await;
}

#[tokio::test]
async fn orders_over_text_wire() {
    orders_scenario(WireType::Text).await;
}

#[tokio::test]
async fn remote_subscriber_sees_bootstrap_and_updates() {
    let node = Node::start(&Config::default()).await.unwrap();
    let local = node.tree().acquire_map("/orders").unwrap();
    local.put(s("A"), s("1")).await.unwrap();

    let client = Client::connect(node.local_addr().unwrap(), &ClientConfig::default())
        .await
        .unwrap();
    let orders = client.tree().acquire_map("/orders").unwrap();
    let mut subscriber = orders.register_subscriber(true, false).await.unwrap();

    let first = subscriber.next_event().await.unwrap();
    assert!(matches!(first, MapEvent::Inserted { ref key, .. } if *key == s("A")));

    local.remove(&s("A")).await.unwrap();
    let second = subscriber.next_event().await.unwrap();
    assert!(matches!(second, MapEvent::Removed { ref key, .. } if *key == s("A")));

    client.close().await;
    assert!(subscriber.next_event().await.is_none());
    node.shutdown().await;
}

#[tokio::test]
async fn clients_watch_nodes_appear() {
    let node = Node::start(&Config::default()).await.unwrap();
    node.tree().acquire_map("/markets/london").unwrap();
    let client = Client::connect(node.local_addr().unwrap(), &ClientConfig::default())
        .await
        .unwrap();

    let mut subscriber = client
        .tree()
        .register_topology_subscriber("/markets")
        .await
        .unwrap();
    assert_eq!(
        subscriber.next_event().await,
        Some(TopologyEvent::Existing {
            asset_name: "markets".to_string(),
            name: "london".to_string(),
        })
    );

    node.tree().acquire_map("/markets/tokyo").unwrap();
    assert_eq!(
        subscriber.next_event().await,
        Some(TopologyEvent::Added {
            asset_name: "markets".to_string(),
            name: "tokyo".to_string(),
        })
    );

    client.close().await;
    assert!(subscriber.next_event().await.is_none());
    node.shutdown().await;
}

#[tokio::test]
async fn references_and_topics_across_hosts() {
    let node = Node::start(&Config::default()).await.unwrap();
    let client = Client::connect(node.local_addr().unwrap(), &ClientConfig::default())
        .await
        .unwrap();

    let greeting = client.tree().acquire_reference("/settings/greeting").unwrap();
    greeting.set(s("hello")).await.unwrap();
    // a read on the same path is answered after the write is applied
    assert_eq!(greeting.get().await.unwrap(), Some(s("hello")));
    let local = node.tree().acquire_map("/settings").unwrap();
    assert_eq!(local.get(&s("greeting")).await.unwrap(), Some(s("hello")));
    assert_eq!(
        greeting.apply("upper_case", Value::Null).await.unwrap(),
        Some(s("HELLO"))
    );

    let publisher = client.tree().acquire_publisher("/news").unwrap();
    let mut topics = publisher.register_topic_subscriber(false).await.unwrap();
    // same connection, so the server has registered the subscriber first
    publisher.publish(s("sport"), s("goal")).await.unwrap();
    assert_eq!(topics.next_event().await, Some((s("sport"), s("goal"))));
    let news = node.tree().acquire_map("/news").unwrap();
    assert_eq!(news.get(&s("sport")).await.unwrap(), Some(s("goal")));

    client.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn errors_leave_the_connection_usable() {
    let node = Node::start(&Config::default()).await.unwrap();
    let client = Client::connect(node.local_addr().unwrap(), &ClientConfig::default())
        .await
        .unwrap();
    let orders = client.tree().acquire_map("/orders").unwrap();

    let err = orders.compute(s("A"), "no_such_function").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Application);

    let err = client
        .connection()
        .call("/orders?view=store", None, "teleport", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    orders.put(s("A"), s("1")).await.unwrap();
    assert_eq!(orders.get(&s("A")).await.unwrap(), Some(s("1")));

    client.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn handles_live_and_die_with_their_connection() {
    let node = Node::start(&Config::default()).await.unwrap();
    let addr = node.local_addr().unwrap();
    let first = Connection::connect(addr, ConnectionOptions::default())
        .await
        .unwrap();
    let second = Connection::connect(addr, ConnectionOptions::default())
        .await
        .unwrap();

    let store = RemoteKeyValueStore::new(first.clone(), "/orders?view=store");
    store.put_all(vec![(s("A"), s("1"))]).await.unwrap();
    let handle = Handle::from_body(
        first
            .call("/orders?view=store", None, "keySet", vec![])
            .await
            .unwrap(),
    )
    .unwrap();
    let keys = store
        .collection(CollectionKind::KeySet)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(keys.size().await.unwrap(), 1);

    // another connection cannot reach the handle
    let err = second
        .call(&handle.csp, Some(handle.cid), "size", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);

    first.close().await;
    let err = keys.size().await.unwrap_err();
    assert!(matches!(err, Error::InvalidHandle { .. }));
    assert_eq!(err.kind(), ErrorKind::Protocol);

    second.close().await;
    node.shutdown().await;
}

#[tokio::test]
async fn calls_time_out_when_the_peer_is_silent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let mut config = ClientConfig::default();
    config.call_timeout_ms = 100;
    let client = Client::connect(addr, &config).await.unwrap();
    let orders = client.tree().acquire_map("/orders").unwrap();

    let err = orders.get(&s("A")).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(err.kind(), ErrorKind::Io);

    client.close().await;
    silent.abort();
}

#[tokio::test]
async fn node_starts_from_a_config_file() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{ "server": {{ "wire": "text" }}, "client": {{ "wire": "text" }},
            "replication": {{ "host_id": 7 }} }}"#
    )
    .unwrap();
    let config = Config::from_file(file.path()).unwrap();
    let node = Node::start(&config).await.unwrap();
    assert_eq!(node.tree().host_id().get(), 7);

    let client = Client::connect(node.local_addr().unwrap(), &config.client)
        .await
        .unwrap();
    let orders = client.tree().acquire_map("/orders").unwrap();
    orders.put(s("A"), s("1")).await.unwrap();
    assert_eq!(orders.size().await.unwrap(), 1);

    client.close().await;
    node.shutdown().await;
}
