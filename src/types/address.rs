use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical queue name, resolved to a physical table by the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueAddress(pub String);

impl QueueAddress {
    /// Create a queue address from a logical name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the address is usable as a SQL identifier
    pub fn is_valid_identifier(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for QueueAddress {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for QueueAddress {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}
