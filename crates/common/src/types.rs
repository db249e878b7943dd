//! Common data types for Switchyard components.
//!
//! Every entity in a session is addressed by an opaque string identifier.
//! Rooms are named by clients; peers take the id of their signaling
//! connection; transports, producers and consumers are allocated by the
//! media engine. Distinct newtypes keep these from being mixed up at the
//! call sites that thread several of them through one operation.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random identifier (UUIDv4).
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume the identifier, returning the inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique identifier for a room, chosen by the client that creates it.
    RoomId
);

string_id!(
    /// Unique identifier for a peer. Equal to its signaling connection id.
    PeerId
);

string_id!(
    /// Media-engine transport identifier.
    TransportId
);

string_id!(
    /// Media-engine producer identifier.
    ProducerId
);

string_id!(
    /// Media-engine consumer identifier.
    ConsumerId
);

string_id!(
    /// Media-engine worker identifier.
    WorkerId
);

string_id!(
    /// Media-engine router identifier.
    RouterId
);

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_are_unique() {
        let a = ProducerId::random();
        let b = ProducerId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = RoomId::from("R1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"R1\"");

        let parsed: PeerId = serde_json::from_str("\"conn-42\"").unwrap();
        assert_eq!(parsed.as_str(), "conn-42");
        assert_eq!(parsed.to_string(), "conn-42");
    }
}
