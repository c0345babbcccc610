use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque client-supplied token naming a source image.
///
/// Cheap to clone. Used as the join key across sources, the source cache and
/// (together with an operation list) the derivative cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(Arc<str>);

impl Identifier {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_equality_and_display() {
        let a = Identifier::from("images/cat.jpg");
        let b = Identifier::from(String::from("images/cat.jpg"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "images/cat.jpg");
        assert_eq!(a.as_str(), "images/cat.jpg");
    }

    #[test]
    fn test_identifier_serializes_as_string() {
        let id = Identifier::from("x.png");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"x.png\"");
    }
}
