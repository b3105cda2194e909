//! Changelog delivery, shared by both ends of a replication session.

use std::future::Future;

use kvtree_core_store::{
    Bootstrap, EngineReplication, Error, HostId, ModificationIterator, ReplicationEntry, Result,
    Value,
};
use kvtree_wire::{param, Body, ReplicationOp};

/// Prepare to stream to a peer that sent `remote`: every local entry newer
/// than the peer's last-applied timestamp is marked dirty again.
pub fn begin_streaming(replication: &dyn EngineReplication, remote: &Bootstrap) {
    tracing::debug!(
        local = %replication.identifier(),
        remote = %remote.identifier,
        from = remote.last_updated_time,
        "re-dirtying entries for peer"
    );
    replication.dirty_entries(remote.identifier, remote.last_updated_time);
}

/// Forward dirty entries until `send` fails.
///
/// Only entries that originated locally and are newer than `floor`, the
/// peer's declared last-applied timestamp, are sent. Each send is awaited
/// before the next, so a slow peer suspends delivery instead of losing
/// entries; anything marked meanwhile stays in the dirty set.
pub async fn deliver<F, Fut>(
    iterator: &ModificationIterator,
    local: HostId,
    floor: u64,
    mut send: F,
) -> Result<()>
where
    F: FnMut(ReplicationEntry) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        for entry in iterator.drain() {
            if entry.origin != local || entry.timestamp <= floor {
                continue;
            }
            tracing::trace!(
                remote = %iterator.remote(),
                key = %entry.key,
                timestamp = entry.timestamp,
                "sending entry"
            );
            send(entry).await?;
        }
        iterator.changed().await;
    }
}

/// Apply a `replicationEvent` push or request body.
pub fn apply_event(replication: &dyn EngineReplication, params: &[Value]) -> Result<bool> {
    let entry = ReplicationEntry::from_value(param(params, 0, "entry")?)?;
    replication.apply_replication(&entry)
}

/// The body announcing `bootstrap`.
pub fn bootstrap_body(bootstrap: &Bootstrap) -> Body {
    Body::event(ReplicationOp::Bootstrap.as_str(), vec![bootstrap.to_value()])
}

/// Read a peer's bootstrap from a reply body.
pub fn bootstrap_from_body(body: Body) -> Result<Bootstrap> {
    match body.into_result()? {
        Body::Event { name, params } if name == ReplicationOp::Bootstrap.as_str() => {
            Bootstrap::from_value(&param(&params, 0, "bootstrap")?)
        }
        other => Err(Error::protocol(format!(
            "expected a bootstrap reply, got {:?}",
            other
        ))),
    }
}

/// Read a peer's identifier from an `identifierReply` body.
pub fn identifier_from_body(body: Body) -> Result<HostId> {
    match body.into_result()? {
        Body::Event { name, params } if name == ReplicationOp::IdentifierReply.as_str() => {
            HostId::from_value(&param(&params, 0, "identifier")?)
        }
        other => Err(Error::protocol(format!(
            "expected an identifier reply, got {:?}",
            other
        ))),
    }
}
