//! kvtree server
//!
//! Serves an [`AssetTree`](kvtree_core_store::AssetTree) over the wire
//! protocol. Each connection is a session that dispatches map requests,
//! collection-handle requests, subscriptions and the accepting side of
//! replication.

mod endpoint;
mod handlers;
mod handles;
mod session;

pub use endpoint::{ServerEndpoint, ServerOptions};
