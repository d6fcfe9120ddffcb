//! Newtype identifiers.
//!
//! Every concept with an identity is a distinct newtype wrapping a `String`.
//! This prevents accidentally passing, for example, a [`MessageId`] where an
//! [`AckToken`] is expected, even though both are opaque provider strings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Configuration-assigned names
// ---------------------------------------------------------------------------

string_id! {
    /// Names a registered queue or stream trigger.
    ///
    /// Used as the `trigger` field on every span and event emitted by a loop,
    /// and as the key in the health registry.
    TriggerName
}

string_id! {
    /// The path segment under `/webhooks/` that a push registration listens on.
    RouteName
}

// ---------------------------------------------------------------------------
// Provider-assigned identifiers
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies one message or delivery as assigned by the provider.
    MessageId
}

impl MessageId {
    /// Generates a random identifier for deliveries that carry none of their own.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

string_id! {
    /// Opaque receipt handle returned by a receive call.
    ///
    /// The only value needed to acknowledge (delete) or extend the visibility
    /// of one received message instance. A redelivered message carries a new
    /// token; tokens from earlier receives may be rejected by the provider.
    AckToken
}

string_id! {
    /// A cursor into an ordered stream (e.g. a shard sequence number).
    ///
    /// Stream records are never acknowledged individually; the loop commits a
    /// position once every record before it has been handled.
    StreamPosition
}
