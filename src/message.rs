//! Comm message payload shared by every layer.

use serde_json::Value;

/// One comm payload: structured data plus ordered binary buffers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommMessage {
    /// JSON-structured data of the message.
    pub data: Value,
    /// Binary blocks transferred alongside `data`. Order is significant.
    pub buffers: Vec<Vec<u8>>,
}

impl CommMessage {
    pub fn new(data: impl Into<Value>) -> Self {
        Self { data: data.into(), buffers: Vec::new() }
    }

    #[must_use]
    pub fn with_buffers(mut self, buffers: Vec<Vec<u8>>) -> Self {
        self.buffers = buffers;
        self
    }
}
