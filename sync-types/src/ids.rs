//! Identity, versioning and ordering types for offsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// Pure code never reads the clock; it receives a `Timestamp` from the caller.
pub type Timestamp = u64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new random identifier (UUID v4).
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Parse an identifier from its hyphenated string form.
            pub fn parse(s: &str) -> Option<Self> {
                uuid::Uuid::parse_str(s).ok().map(Self)
            }

            /// Get the inner UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Client-generated identifier of a queued mutation.
    ///
    /// Doubles as the idempotency key on the remote store: replaying the same
    /// id never applies the mutation twice.
    MutationId
);

uuid_id!(
    /// Identifier of a server-granted record lock.
    LockId
);

uuid_id!(
    /// Identifier of this device (one per local cache).
    DeviceId
);

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an identifier issued by the authentication layer.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

string_id!(
    /// Tenant (organisation) scope. Every lock and mutation belongs to one.
    TenantId
);

string_id!(
    /// A user, as identified by the session layer.
    UserId
);

/// Identifies one business record: an entity type tag plus its id.
///
/// The payload behind the key is opaque to this crate.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity type tag (e.g. `"invoice"`).
    pub entity_type: String,
    /// Entity identifier within its type.
    pub entity_id: String,
}

impl EntityKey {
    /// Create a key from a type tag and an id.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey({})", self)
    }
}

/// Version of an entity, assigned by the remote store.
///
/// The first acknowledged write of an entity gets version 1. Versions only
/// ever grow; comparing them decides whether a notification is stale.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Create a Version with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The version following this one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

/// Per-tenant change counter assigned by the remote store.
///
/// Every applied mutation gets the next sequence number for its tenant. The
/// realtime handler uses it to notice missed notifications and to ask for
/// everything after the last contiguous value when it reconnects.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    /// Create a Sequence with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Sequence representing "nothing seen yet".
    pub fn zero() -> Self {
        Self(0)
    }

    /// Increment the sequence by one.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_id_is_uuid_v4() {
        let id = MutationId::new();
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn mutation_id_parses_own_display() {
        let id = MutationId::new();
        assert_eq!(MutationId::parse(&id.to_string()), Some(id));
        assert_eq!(MutationId::parse("not-a-uuid"), None);
    }

    #[test]
    fn ids_serialize_transparently() {
        let tenant = TenantId::new("acme");
        assert_eq!(serde_json::to_string(&tenant).unwrap(), "\"acme\"");

        let version = Version::new(7);
        assert_eq!(serde_json::to_string(&version).unwrap(), "7");
    }

    #[test]
    fn entity_key_display() {
        let key = EntityKey::new("invoice", "R1");
        assert_eq!(key.to_string(), "invoice/R1");
    }

    #[test]
    fn version_ordering() {
        assert!(Version::new(1) < Version::new(2));
        assert_eq!(Version::new(1).next(), Version::new(2));
    }

    #[test]
    fn sequence_saturating_add() {
        let s = Sequence::new(u64::MAX);
        assert_eq!(s.next().value(), u64::MAX);
    }
}
