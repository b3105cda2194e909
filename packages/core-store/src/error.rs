//! Error types shared by every kvtree layer.
//!
//! Errors fall into five families: argument errors raised before any I/O,
//! not-found errors from path and rule resolution, protocol errors from the
//! wire, I/O errors from the transport, and application errors raised while
//! evaluating an operation against a store. [`ErrorKind`] names the family so
//! that a server can report it in an error reply and the client can rebuild
//! an error of the same family.

use serde::{Deserialize, Serialize};

use crate::path::PathError;

/// Errors raised by resource trees, stores and the wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A key, value or option was rejected before any work was done.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Path parsing failed.
    #[error("path error: {0}")]
    Path(#[from] PathError),

    /// No node, rule, view or handle resolves.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A request context was mutated after it was sealed.
    #[error("request context is sealed")]
    Sealed,

    /// A malformed or unexpected wire message.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The peer asked for an event this handler does not know.
    #[error("unsupported event={event}")]
    UnsupportedEvent { event: String },

    /// A remote object handle is unknown on this connection.
    #[error("invalid handle cid={cid} for {csp}")]
    InvalidHandle { csp: String, cid: i64 },

    /// Encoding or decoding a wire document failed.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Transport failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection closed while a call was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// No reply arrived for a call in time.
    #[error("timed out waiting for reply to tid={tid}")]
    Timeout { tid: i64 },

    /// The operation is not supported by this view.
    #[error("unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// An operation failed while being applied to a store.
    #[error("application error: {message}")]
    Application { message: String },
}

/// The family an [`Error`] belongs to, as carried in error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Protocol,
    Io,
    Unsupported,
    Application,
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Error::Application {
            message: message.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Error::Unsupported {
            operation: operation.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument { .. } | Error::Path(_) | Error::Sealed => {
                ErrorKind::InvalidArgument
            }
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Protocol { .. }
            | Error::UnsupportedEvent { .. }
            | Error::InvalidHandle { .. }
            | Error::Codec { .. } => ErrorKind::Protocol,
            Error::Io(_) | Error::ConnectionClosed | Error::Timeout { .. } => ErrorKind::Io,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::Application { .. } => ErrorKind::Application,
        }
    }

    /// The message carried in an error reply. Variants whose kind already
    /// names them send their bare message so it is not prefixed twice.
    pub fn reply_message(&self) -> String {
        match self {
            Error::InvalidArgument { message }
            | Error::Protocol { message }
            | Error::Application { message } => message.clone(),
            Error::NotFound { what } => what.clone(),
            Error::Unsupported { operation } => operation.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from the kind and message of an error reply.
    pub fn from_reply(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::InvalidArgument => Error::InvalidArgument { message },
            ErrorKind::NotFound => Error::NotFound { what: message },
            ErrorKind::Protocol => Error::Protocol { message },
            ErrorKind::Io => Error::Io(std::io::Error::other(message)),
            ErrorKind::Unsupported => Error::Unsupported { operation: message },
            ErrorKind::Application => Error::Application { message },
        }
    }
}

/// Result alias used throughout kvtree.
pub type Result<T> = std::result::Result<T, Error>;
