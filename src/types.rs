//! NewType wrappers for strong typing throughout the engine.
//!
//! Service names are the key of every per-service table (environments,
//! running instances, transition locks), so they get their own type instead
//! of travelling around as bare strings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
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

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Name of a managed service as declared in its descriptor.
    ///
    /// This is the directory name under the services root and the key used
    /// by the provisioner and the lifecycle manager.
    ServiceName
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_service_name_creation() {
        let name = ServiceName::new("calc");
        assert_eq!(name.as_str(), "calc");
        assert_eq!(name.to_string(), "calc");
    }

    #[test]
    fn test_service_name_from_string() {
        let name: ServiceName = "calc".into();
        assert_eq!(name.as_str(), "calc");

        let name: ServiceName = String::from("ocr").into();
        assert_eq!(name.into_inner(), "ocr");
    }

    #[test]
    fn test_service_name_borrow_lookup() {
        let mut map = HashMap::new();
        map.insert(ServiceName::new("calc"), 9001u16);

        // Borrow<str> lets tables keyed by ServiceName be queried with &str
        assert_eq!(map.get("calc"), Some(&9001));
        assert_eq!(map.get("missing"), None);
    }

    #[test]
    fn test_service_name_serde_transparent() {
        let name = ServiceName::new("calc");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"calc\"");

        let back: ServiceName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }
}
