use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::MessageId;

/// Transport message - opaque payload plus a string header map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable message identifier
    pub id: MessageId,

    /// Header mapping, persisted alongside the body
    pub headers: HashMap<String, String>,

    /// Opaque payload bytes
    pub body: Vec<u8>,
}

impl Message {
    /// Create a new message with a fresh ID
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            id: MessageId::new(),
            headers: HashMap::new(),
            body,
        }
    }

    /// Create a message with an explicit ID
    pub fn with_id(id: MessageId, body: Vec<u8>) -> Self {
        Self {
            id,
            headers: HashMap::new(),
            body,
        }
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get a header value by key
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }

    /// Get the payload size in bytes
    pub fn body_size(&self) -> usize {
        self.body.len()
    }
}
