//! Operation codes.
//!
//! Each handler family has a closed set of event names. The `op_codes!`
//! macro generates the enum together with its name table, so a request's
//! event name parses into exactly one variant or fails with
//! [`Error::UnsupportedEvent`].

use kvtree_core_store::Error;

macro_rules! op_codes {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every op code, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The event name on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(Error::UnsupportedEvent {
                        event: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

op_codes! {
    /// Operations on a map or store capability path.
    MapOp {
        Size => "size",
        ContainsKey => "containsKey",
        ContainsValue => "containsValue",
        Get => "get",
        GetAndPut => "getAndPut",
        Put => "put",
        GetAndRemove => "getAndRemove",
        Remove => "remove",
        Clear => "clear",
        KeySet => "keySet",
        Values => "values",
        EntrySet => "entrySet",
        Replace => "replace",
        ReplaceIfEqual => "replaceIfEqual",
        PutIfAbsent => "putIfAbsent",
        RemoveIfEqual => "removeIfEqual",
        PutAll => "putAll",
        HashCode => "hashCode",
        ApplyTo => "applyTo",
        AsyncUpdate => "asyncUpdate",
        SyncUpdate => "syncUpdate",
    }
}

impl MapOp {
    /// Operations the client sends without waiting for a reply.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, MapOp::Put | MapOp::Remove | MapOp::AsyncUpdate)
    }
}

op_codes! {
    /// Operations on a collection handle.
    CollectionOp {
        Size => "size",
        IsEmpty => "isEmpty",
        Add => "add",
        AddAll => "addAll",
        RetainAll => "retainAll",
        ContainsAll => "containsAll",
        RemoveAll => "removeAll",
        Clear => "clear",
        Remove => "remove",
        Contains => "contains",
        Iterator => "iterator",
        NumberOfSegments => "numberOfSegments",
    }
}

op_codes! {
    /// Subscription requests and the pushes that answer them.
    SubscriptionOp {
        RegisterSubscriber => "registerSubscriber",
        UnregisterSubscriber => "unregisterSubscriber",
        /// Push: one map event.
        OnEvent => "onEvent",
        /// Push: the subscription has ended.
        OnEndOfSubscription => "onEndOfSubscription",
    }
}

op_codes! {
    /// The replication handshake and changelog stream.
    ReplicationOp {
        Identifier => "identifier",
        IdentifierReply => "identifierReply",
        Bootstrap => "bootstrap",
        ReplicationSubscribe => "replicationSubscribe",
        ReplicationEvent => "replicationEvent",
    }
}

impl ReplicationOp {
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(self, ReplicationOp::ReplicationEvent)
    }
}
