//! kvtree wire protocol
//!
//! Request/reply/push messaging over a byte stream:
//! - `Document`: a `Header` (tid, csp, cid) and a `Body`
//! - `WireCodec`: `TextWire` (JSON) or `BinaryWire` (bincode)
//! - framing: a 4-byte big-endian length, then the encoded document
//! - `Connection`: the client end, with tid correlation, timeouts and
//!   subscription listeners
//! - op codes: the closed event-name sets of each handler family
//!
//! The server end lives in `kvtree-server`; it reuses the framing and
//! documents defined here.

mod codec;
mod connection;
mod document;
pub mod frame;
mod ops;

pub use codec::{BinaryWire, TextWire, WireCodec, WireType};
pub use connection::{Connection, ConnectionOptions, Listener};
pub use document::{param, Body, Document, Handle, Header};
pub use frame::{FrameWriter, DEFAULT_MAX_FRAME};
pub use ops::{CollectionOp, MapOp, ReplicationOp, SubscriptionOp};
