//! Typed ID wrappers for the aggregator.
//!
//! IDs are opaque String wrappers (serde-transparent). Source ids are chosen
//! by the caller and only need to be unique within one request; request ids
//! default to a random UUID.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Identifier of one aggregation request (one client stream).
    RequestId
);
typed_id!(
    /// Identifier of an upstream source, unique within one request.
    SourceId
);

impl RequestId {
    /// Create a new request id using UUID v4 (random).
    pub fn new_uuid() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new_uuid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_new_is_unique() {
        let a = RequestId::new_uuid();
        let b = RequestId::new_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn source_id_from_str_trait() {
        let id: SourceId = "gpt".into();
        assert_eq!(id.as_str(), "gpt");
        assert_eq!(id.to_string(), "gpt");
    }

    #[test]
    fn source_id_serializes_transparently() {
        let id = SourceId::from_string("claude");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"claude\"");
        let back: SourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn source_id_hash_equality() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(SourceId::from_string("same"));
        assert!(set.contains(&SourceId::from_string("same")));
    }
}
