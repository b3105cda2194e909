//! kvtree replication
//!
//! Keeps copies of one resource on several hosts consistent. Every host
//! stamps its own mutations with its host id and a logical clock; peers
//! exchange only the entries they originated, so nothing loops, and resolve
//! conflicts last-writer-wins on (timestamp, origin).
//!
//! - [`ReplicationHub`]: the connecting side, with handshake and reconnects
//! - [`deliver`]: the changelog forwarding loop both sides run
//! - [`SessionState`]: observable through a `watch` channel
//!
//! The accepting side is served by `kvtree-server`, which uses the same
//! delivery functions.

mod delivery;
mod hub;
mod state;

pub use delivery::{
    apply_event, begin_streaming, bootstrap_body, bootstrap_from_body, deliver,
    identifier_from_body,
};
pub use hub::{ReplicationHub, ReplicationOptions};
pub use state::SessionState;
