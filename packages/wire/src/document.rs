//! Wire documents: one header and one body per frame.

use std::collections::BTreeMap;

use kvtree_core_store::{Error, ErrorKind, Result, Value};
use serde::{Deserialize, Serialize};

/// Routing information carried by every document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Transaction id. Replies echo it; subscription pushes reuse the tid
    /// of the registering request.
    pub tid: i64,
    /// The capability path the request is addressed to.
    pub csp: Option<String>,
    /// A connection-scoped handle id, set when addressing a handle.
    pub cid: Option<i64>,
}

impl Header {
    pub fn new(tid: i64) -> Self {
        Self {
            tid,
            csp: None,
            cid: None,
        }
    }

    pub fn with_csp(mut self, csp: impl Into<String>) -> Self {
        self.csp = Some(csp.into());
        self
    }

    pub fn with_cid(mut self, cid: i64) -> Self {
        self.cid = Some(cid);
        self
    }
}

/// The payload of a document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Body {
    /// A void acknowledgement.
    Empty,
    /// A request, or a push on a subscription.
    Event { name: String, params: Vec<Value> },
    /// A single-value reply.
    Reply(Value),
    /// A multi-field reply, such as a handle.
    Nested(BTreeMap<String, Value>),
    /// A failed request.
    Exception { kind: ErrorKind, message: String },
}

impl Body {
    pub fn event(name: impl Into<String>, params: Vec<Value>) -> Self {
        Body::Event {
            name: name.into(),
            params,
        }
    }

    pub fn exception(error: &Error) -> Self {
        Body::Exception {
            kind: error.kind(),
            message: error.reply_message(),
        }
    }

    /// Turn an exception body back into an error, passing anything else
    /// through.
    pub fn into_result(self) -> Result<Body> {
        match self {
            Body::Exception { kind, message } => Err(Error::from_reply(kind, message)),
            other => Ok(other),
        }
    }

    /// The value of a `Reply`, or `Null` for `Empty`.
    pub fn into_value(self) -> Result<Value> {
        match self.into_result()? {
            Body::Reply(value) => Ok(value),
            Body::Empty => Ok(Value::Null),
            other => Err(Error::protocol(format!("expected a reply, got {:?}", other))),
        }
    }

    /// The fields of a `Nested` reply.
    pub fn into_nested(self) -> Result<BTreeMap<String, Value>> {
        match self.into_result()? {
            Body::Nested(fields) => Ok(fields),
            other => Err(Error::protocol(format!(
                "expected a nested reply, got {:?}",
                other
            ))),
        }
    }
}

/// One framed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub header: Header,
    pub body: Body,
}

impl Document {
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }

    pub fn tid(&self) -> i64 {
        self.header.tid
    }
}

/// A reference to a server-side collection bound to one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handle {
    pub csp: String,
    pub cid: i64,
}

impl Handle {
    pub fn to_body(&self) -> Body {
        let mut fields = BTreeMap::new();
        fields.insert("csp".to_string(), Value::from(self.csp.as_str()));
        fields.insert("cid".to_string(), Value::Integer(self.cid));
        Body::Nested(fields)
    }

    pub fn from_body(body: Body) -> Result<Self> {
        let fields = body.into_nested()?;
        let csp = fields
            .get("csp")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("handle reply is missing 'csp'"))?;
        let cid = fields
            .get("cid")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::protocol("handle reply is missing 'cid'"))?;
        Ok(Handle {
            csp: csp.to_string(),
            cid,
        })
    }
}

/// Take the positional parameter at `index`.
pub fn param(params: &[Value], index: usize, name: &str) -> Result<Value> {
    params
        .get(index)
        .cloned()
        .ok_or_else(|| Error::protocol(format!("missing parameter {} ({})", index, name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_rebuilds_error_family() {
        let body = Body::exception(&Error::application("boom"));
        let err = body.into_value().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Application);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn empty_reads_as_null() {
        assert_eq!(Body::Empty.into_value().unwrap(), Value::Null);
    }

    #[test]
    fn handle_body() {
        let handle = Handle {
            csp: "/orders?view=keySet".to_string(),
            cid: 3,
        };
        assert_eq!(Handle::from_body(handle.to_body()).unwrap(), handle);
        assert!(Handle::from_body(Body::Reply(Value::Integer(1))).is_err());
    }

    #[test]
    fn missing_param_is_protocol_error() {
        let err = param(&[Value::from("k")], 1, "value").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn header_builders() {
        let header = Header::new(7).with_csp("/a?view=map").with_cid(2);
        assert_eq!(header.tid, 7);
        assert_eq!(header.csp.as_deref(), Some("/a?view=map"));
        assert_eq!(header.cid, Some(2));
    }
}
