//! Interned string identifiers.

use std::fmt;
use std::sync::Arc;

/// A cheap, clonable string identifier.
///
/// Used wherever the engine needs an open, extensible key space: flow types,
/// stage names, instance identifiers, uniform names. Equality and hashing are
/// by string content, so two independently constructed `KeyId`s with the same
/// text compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(Arc<str>);

impl KeyId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for KeyId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_id_equality_by_content() {
        let a = KeyId::new("lumenflow:rasterization");
        let b = KeyId::from("lumenflow:rasterization");
        let c = KeyId::new("lumenflow:compute");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_id_display() {
        let id = KeyId::new("stage:entities");
        assert_eq!(id.to_string(), "stage:entities");
        assert_eq!(id.as_str(), "stage:entities");
    }

    #[test]
    fn test_key_id_clone_is_cheap_and_equal() {
        let a = KeyId::new("x");
        let b = a.clone();
        assert_eq!(a, b);
    }
}
