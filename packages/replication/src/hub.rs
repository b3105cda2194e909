//! The connecting side of a replication session.
//!
//! A [`ReplicationHub`] keeps one local store in step with one remote host.
//! Each session runs the handshake, then streams in both directions until
//! the connection drops:
//!
//! 1. `identifier` learns the peer's host id
//! 2. `replicationSubscribe` opens the push stream of the peer's entries
//! 3. `bootstrap` swaps last-applied timestamps; both sides then re-dirty
//!    what the other is missing and start forwarding
//!
//! Per-peer state lives in the store, so a later session resumes from the
//! last-applied timestamps instead of starting over.

use std::sync::Arc;
use std::time::Duration;

use kvtree_core_store::{
    Bootstrap, EngineReplication, Error, RequestContext, Result, ViewType,
};
use kvtree_wire::{Body, Connection, ConnectionOptions, ReplicationOp};
use tokio::net::ToSocketAddrs;
use tokio::sync::watch;

use crate::delivery::{
    apply_event, begin_streaming, bootstrap_from_body, deliver, identifier_from_body,
};
use crate::SessionState;

/// Connection and retry settings for a hub.
#[derive(Clone, Debug)]
pub struct ReplicationOptions {
    pub connection: ConnectionOptions,
    pub reconnect_interval: Duration,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

pub struct ReplicationHub {
    replication: Arc<dyn EngineReplication>,
    csp: String,
    options: ReplicationOptions,
    state: watch::Sender<SessionState>,
    shutdown: watch::Sender<bool>,
}

impl ReplicationHub {
    /// A hub replicating `replication` with the resource at `uri` on the
    /// remote host.
    pub fn new(
        replication: Arc<dyn EngineReplication>,
        uri: &str,
        options: ReplicationOptions,
    ) -> Result<Self> {
        let mut ctx = RequestContext::parse(uri)?;
        ctx.set_view_type(ViewType::Replication)?;
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            replication,
            csp: ctx.to_uri(),
            options,
            state,
            shutdown,
        })
    }

    pub fn csp(&self) -> &str {
        &self.csp
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Wait until the session reaches `state`.
    pub async fn wait_for_state(&self, state: SessionState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// Stop [`ReplicationHub::run`] and end the current session.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(csp = %self.csp, from = %previous, to = %state, "replication state");
        }
    }

    /// Connect to `addr` and replicate, reconnecting after every lost
    /// session, until [`ReplicationHub::shutdown`] is called.
    pub async fn run<A>(&self, addr: A)
    where
        A: ToSocketAddrs + Clone,
    {
        let mut shutdown = self.shutdown.subscribe();
        while !*shutdown.borrow() {
            match Connection::connect(addr.clone(), self.options.connection.clone()).await {
                Ok(connection) => {
                    tokio::select! {
                        result = self.run_session(&connection) => {
                            if let Err(e) = result {
                                tracing::warn!(
                                    csp = %self.csp,
                                    error = %e,
                                    "replication session ended"
                                );
                            }
                        }
                        _ = shut_down(&mut shutdown) => {}
                    }
                    connection.close().await;
                    self.set_state(SessionState::Disconnected);
                }
                Err(e) => {
                    tracing::debug!(csp = %self.csp, error = %e, "replication connect failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.reconnect_interval) => {}
                _ = shut_down(&mut shutdown) => {}
            }
        }
        tracing::debug!(csp = %self.csp, "replication hub stopped");
    }

    /// Run one session over an established connection. Returns when the
    /// connection is lost or the peer misbehaves; the state is then
    /// `Disconnected`.
    pub async fn run_session(&self, connection: &Connection) -> Result<()> {
        let result = self.session(connection).await;
        self.set_state(SessionState::Disconnected);
        result
    }

    async fn session(&self, connection: &Connection) -> Result<()> {
        self.set_state(SessionState::Handshaking);
        let local = self.replication.identifier();

        let reply = connection
            .call(
                &self.csp,
                None,
                ReplicationOp::Identifier.as_str(),
                vec![local.to_value()],
            )
            .await?;
        let remote = identifier_from_body(reply)?;
        if remote == local {
            return Err(Error::protocol(format!(
                "peer has the same host id {}",
                local
            )));
        }
        let iterator = self.replication.acquire_modification_iterator(remote);

        let (tid, mut listener) = connection
            .subscribe(
                &self.csp,
                ReplicationOp::ReplicationSubscribe.as_str(),
                vec![local.to_value()],
            )
            .await?;

        let ours = Bootstrap {
            identifier: local,
            last_updated_time: self.replication.last_modification_time(remote),
        };
        let reply = connection
            .call(
                &self.csp,
                None,
                ReplicationOp::Bootstrap.as_str(),
                vec![ours.to_value()],
            )
            .await?;
        let theirs = bootstrap_from_body(reply)?;
        if theirs.identifier != remote {
            connection.unsubscribe(tid);
            return Err(Error::protocol(format!(
                "bootstrap from {} on a session with {}",
                theirs.identifier, remote
            )));
        }

        begin_streaming(self.replication.as_ref(), &theirs);
        self.set_state(SessionState::Streaming);
        tracing::info!(
            csp = %self.csp,
            %local,
            %remote,
            resume_from = ours.last_updated_time,
            "replication streaming"
        );

        let csp = self.csp.as_str();
        let outbound = deliver(&iterator, local, theirs.last_updated_time, |entry| {
            let connection = connection.clone();
            async move {
                connection
                    .send(
                        csp,
                        None,
                        ReplicationOp::ReplicationEvent.as_str(),
                        vec![entry.to_value()],
                    )
                    .await
            }
        });

        let replication = self.replication.clone();
        let inbound = async move {
            while let Some(body) = listener.recv().await {
                match body {
                    Body::Event { name, params }
                        if name == ReplicationOp::ReplicationEvent.as_str() =>
                    {
                        if let Err(e) = apply_event(replication.as_ref(), &params) {
                            tracing::warn!(error = %e, "could not apply replication entry");
                        }
                    }
                    Body::Exception { kind, message } => {
                        return Err(Error::from_reply(kind, message));
                    }
                    other => tracing::debug!(?other, "unexpected replication push"),
                }
            }
            Err(Error::ConnectionClosed)
        };

        let result = tokio::select! {
            result = outbound => result,
            result = inbound => result,
            _ = connection.closed() => Err(Error::ConnectionClosed),
        };
        connection.unsubscribe(tid);
        result
    }
}

async fn shut_down(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

impl std::fmt::Debug for ReplicationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHub")
            .field("csp", &self.csp)
            .field("local", &self.replication.identifier())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvtree_core_store::{AssetTree, HostId, ReplicationEntry, Value};
    use kvtree_wire::frame::read_document;
    use kvtree_wire::{Document, FrameWriter, Header, TextWire, DEFAULT_MAX_FRAME};

    fn host(id: u8) -> HostId {
        HostId::new(id).unwrap()
    }

    async fn expect_event<R>(reader: &mut R, op: ReplicationOp) -> Document
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let document = read_document(reader, &TextWire, DEFAULT_MAX_FRAME)
            .await
            .unwrap()
            .unwrap();
        match &document.body {
            Body::Event { name, .. } if name == op.as_str() => document,
            other => panic!("expected {}, got {:?}", op, other),
        }
    }

    fn entry_of(document: &Document) -> ReplicationEntry {
        let Body::Event { params, .. } = &document.body else {
            panic!("not an event");
        };
        ReplicationEntry::from_value(params[0].clone()).unwrap()
    }

    #[test]
    fn csp_names_replication_view() {
        let tree = AssetTree::for_testing();
        let replication = tree.acquire_replication("/orders").unwrap();
        let hub = ReplicationHub::new(replication, "/orders", ReplicationOptions::default())
            .unwrap();
        assert_eq!(hub.csp(), "/orders?view=replication");
        assert_eq!(hub.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn handshake_then_stream_both_ways() {
        let tree = AssetTree::for_host(host(1));
        let store = tree.acquire_store("/orders").unwrap();
        let replication = tree.acquire_replication("/orders").unwrap();
        store.put(Value::from("early"), Value::from("1")).await.unwrap();

        let hub = Arc::new(
            ReplicationHub::new(replication, "/orders", ReplicationOptions::default()).unwrap(),
        );
        let (client, server) = tokio::io::duplex(64 * 1024);
        let connection = Connection::from_stream(
            client,
            ConnectionOptions::default().with_codec(Arc::new(TextWire)),
        );
        let session = tokio::spawn({
            let hub = hub.clone();
            let connection = connection.clone();
            async move { hub.run_session(&connection).await }
        });

        let (mut reader, writer) = tokio::io::split(server);
        let writer = FrameWriter::new(writer, Arc::new(TextWire), DEFAULT_MAX_FRAME);

        let request = expect_event(&mut reader, ReplicationOp::Identifier).await;
        writer
            .write(&Document::new(
                Header::new(request.tid()),
                Body::event(ReplicationOp::IdentifierReply.as_str(), vec![host(2).to_value()]),
            ))
            .await
            .unwrap();

        let subscribe = expect_event(&mut reader, ReplicationOp::ReplicationSubscribe).await;
        let request = expect_event(&mut reader, ReplicationOp::Bootstrap).await;
        let peer = Bootstrap {
            identifier: host(2),
            last_updated_time: 0,
        };
        writer
            .write(&Document::new(
                Header::new(request.tid()),
                crate::delivery::bootstrap_body(&peer),
            ))
            .await
            .unwrap();

        hub.wait_for_state(SessionState::Streaming).await;

        // entries written before the session arrive as bootstrap entries
        let first = entry_of(&expect_event(&mut reader, ReplicationOp::ReplicationEvent).await);
        assert_eq!(first.key, Value::from("early"));
        assert!(first.bootstrap);

        store.put(Value::from("live"), Value::from("2")).await.unwrap();
        let second = entry_of(&expect_event(&mut reader, ReplicationOp::ReplicationEvent).await);
        assert_eq!(second.key, Value::from("live"));
        assert_eq!(second.origin, host(1));
        assert!(!second.bootstrap);

        // the peer pushes one of its own entries on the subscription tid
        let pushed = ReplicationEntry {
            key: Value::from("remote"),
            value: Some(Value::from("3")),
            origin: host(2),
            timestamp: 7,
            bootstrap: false,
        };
        writer
            .write(&Document::new(
                Header::new(subscribe.tid()),
                Body::event(
                    ReplicationOp::ReplicationEvent.as_str(),
                    vec![pushed.to_value()],
                ),
            ))
            .await
            .unwrap();

        let mut applied = None;
        for _ in 0..100 {
            applied = store.get(&Value::from("remote")).await.unwrap();
            if applied.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(applied, Some(Value::from("3")));

        drop(writer);
        drop(reader);
        let result = session.await.unwrap();
        assert!(result.is_err());
        assert_eq!(hub.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let tree = AssetTree::for_testing();
        let replication = tree.acquire_replication("/orders").unwrap();
        let options = ReplicationOptions {
            reconnect_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let hub = Arc::new(ReplicationHub::new(replication, "/orders", options).unwrap());

        // nothing listens on this port; the hub keeps retrying
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let task = tokio::spawn({
            let hub = hub.clone();
            async move { hub.run(addr).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hub.state(), SessionState::Disconnected);
    }
}
