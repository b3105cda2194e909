//! Map events and subscriber channels.
//!
//! Subscribers are fed through one unbounded channel each. A subscriber drains
//! its channel at its own pace; the end of a subscription is a terminal
//! [`Delivery::EndOfSubscription`] value rather than an error.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Error, Result, Value};

/// A change to one entry of a map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapEvent {
    Inserted {
        asset_name: String,
        key: Value,
        value: Value,
    },
    Updated {
        asset_name: String,
        key: Value,
        old_value: Option<Value>,
        value: Value,
    },
    Removed {
        asset_name: String,
        key: Value,
        old_value: Value,
    },
}

impl MapEvent {
    pub fn key(&self) -> &Value {
        match self {
            MapEvent::Inserted { key, .. }
            | MapEvent::Updated { key, .. }
            | MapEvent::Removed { key, .. } => key,
        }
    }

    /// The value after the change, `None` for removals.
    pub fn value(&self) -> Option<&Value> {
        match self {
            MapEvent::Inserted { value, .. } | MapEvent::Updated { value, .. } => Some(value),
            MapEvent::Removed { .. } => None,
        }
    }

    pub fn asset_name(&self) -> &str {
        match self {
            MapEvent::Inserted { asset_name, .. }
            | MapEvent::Updated { asset_name, .. }
            | MapEvent::Removed { asset_name, .. } => asset_name,
        }
    }

    /// Drop the previous value of an update.
    pub fn without_old_value(self) -> Self {
        match self {
            MapEvent::Updated {
                asset_name,
                key,
                value,
                ..
            } => MapEvent::Updated {
                asset_name,
                key,
                old_value: None,
                value,
            },
            other => other,
        }
    }

    /// Encode as a map value for the wire.
    pub fn to_value(&self) -> Value {
        let mut fields = BTreeMap::new();
        let kind = match self {
            MapEvent::Inserted { value, .. } => {
                fields.insert("value".to_string(), value.clone());
                "inserted"
            }
            MapEvent::Updated {
                old_value, value, ..
            } => {
                if let Some(old) = old_value {
                    fields.insert("oldValue".to_string(), old.clone());
                }
                fields.insert("value".to_string(), value.clone());
                "updated"
            }
            MapEvent::Removed { old_value, .. } => {
                fields.insert("oldValue".to_string(), old_value.clone());
                "removed"
            }
        };
        fields.insert("type".to_string(), Value::from(kind));
        fields.insert("assetName".to_string(), Value::from(self.asset_name()));
        fields.insert("key".to_string(), self.key().clone());
        Value::Map(fields)
    }

    /// Decode the form produced by [`MapEvent::to_value`].
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Map(mut fields) = value else {
            return Err(Error::protocol("map event must be a map"));
        };
        let mut take = |name: &str| {
            fields
                .remove(name)
                .ok_or_else(|| Error::protocol(format!("map event is missing '{}'", name)))
        };
        let kind = take("type")?;
        let asset_name = take("assetName")?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::protocol("assetName must be a string"))?;
        let key = take("key")?;
        match kind.as_str() {
            Some("inserted") => Ok(MapEvent::Inserted {
                asset_name,
                key,
                value: take("value")?,
            }),
            Some("updated") => Ok(MapEvent::Updated {
                asset_name,
                key,
                old_value: take("oldValue").ok(),
                value: take("value")?,
            }),
            Some("removed") => Ok(MapEvent::Removed {
                asset_name,
                key,
                old_value: take("oldValue")?,
            }),
            _ => Err(Error::protocol(format!("unknown map event type {}", kind))),
        }
    }
}

impl fmt::Display for MapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapEvent::Inserted { key, value, .. } => write!(f, "inserted {}={}", key, value),
            MapEvent::Updated {
                key,
                old_value: Some(old),
                value,
                ..
            } => write!(f, "updated {}={}\u{2192}{}", key, old, value),
            MapEvent::Updated { key, value, .. } => write!(f, "updated {}={}", key, value),
            MapEvent::Removed { key, old_value, .. } => {
                write!(f, "removed {} (was {})", key, old_value)
            }
        }
    }
}

/// One item on a subscriber channel.
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery<E> {
    Event(E),
    EndOfSubscription,
}

/// Identifies a subscriber within the subscription that issued it.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options a subscriber registers with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Receive the current contents first, as insert events.
    pub bootstrap: bool,
    /// End the subscription once the bootstrap events are delivered.
    pub end_after_bootstrap: bool,
    /// Leave the previous value out of update events.
    pub null_old_value_on_update: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            bootstrap: true,
            end_after_bootstrap: false,
            null_old_value_on_update: false,
        }
    }
}

impl SubscriptionOptions {
    pub fn from_context(ctx: &crate::RequestContext) -> Self {
        Self {
            bootstrap: ctx.bootstrap(),
            end_after_bootstrap: ctx.end_subscription_after_bootstrap(),
            null_old_value_on_update: ctx.null_old_value_on_update_event(),
        }
    }
}

/// The producing half of a subscriber channel.
#[derive(Debug)]
pub struct SubscriberSink<E> {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Delivery<E>>,
}

impl<E> Clone for SubscriberSink<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<E> SubscriberSink<E> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Deliver an event. Returns false once the subscriber has gone away.
    pub fn send(&self, event: E) -> bool {
        self.tx.send(Delivery::Event(event)).is_ok()
    }

    /// Deliver the terminal sentinel.
    pub fn end(&self) {
        let _ = self.tx.send(Delivery::EndOfSubscription);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The consuming half of a subscriber channel.
#[derive(Debug)]
pub struct Subscriber<E> {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Delivery<E>>,
    ended: bool,
}

/// Create a connected sink and subscriber.
pub fn subscriber_channel<E>(id: SubscriberId) -> (SubscriberSink<E>, Subscriber<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SubscriberSink { id, tx },
        Subscriber {
            id,
            rx,
            ended: false,
        },
    )
}

impl<E> Subscriber<E> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next delivery. A dropped producer reads as the end of
    /// the subscription; after the end this returns `None`.
    pub async fn recv(&mut self) -> Option<Delivery<E>> {
        if self.ended {
            return None;
        }
        match self.rx.recv().await {
            Some(Delivery::Event(e)) => Some(Delivery::Event(e)),
            Some(Delivery::EndOfSubscription) | None => {
                self.ended = true;
                Some(Delivery::EndOfSubscription)
            }
        }
    }

    /// Wait for the next event, `None` at the end of the subscription.
    pub async fn next_event(&mut self) -> Option<E> {
        match self.recv().await? {
            Delivery::Event(e) => Some(e),
            Delivery::EndOfSubscription => None,
        }
    }

    /// Take a delivery that is already queued.
    pub fn try_recv(&mut self) -> Option<Delivery<E>> {
        if self.ended {
            return None;
        }
        match self.rx.try_recv() {
            Ok(Delivery::Event(e)) => Some(Delivery::Event(e)),
            Ok(Delivery::EndOfSubscription) | Err(mpsc::error::TryRecvError::Disconnected) => {
                self.ended = true;
                Some(Delivery::EndOfSubscription)
            }
            Err(mpsc::error::TryRecvError::Empty) => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}
