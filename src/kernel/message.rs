//! Kernel message envelope and comm contents.
//!
//! DESIGN
//! ======
//! Only the parts of the Jupyter messaging envelope that comms touch are
//! modeled. `content` stays a `serde_json::Value` on the envelope and is
//! parsed into a typed comm content on demand, so non-comm IOPub traffic
//! never pays for (or fails) a parse. Binary buffers travel beside the JSON
//! and are never serialized with it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::dispatcher::Notification;
use crate::message::CommMessage;

// =============================================================================
// MESSAGE TYPES
// =============================================================================

pub const COMM_OPEN: &str = "comm_open";
pub const COMM_MSG: &str = "comm_msg";
pub const COMM_CLOSE: &str = "comm_close";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelChannel {
    Shell,
    Iopub,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed {msg_type} content: {source}")]
    InvalidContent {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// ENVELOPE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    pub username: String,
    pub session: String,
    pub date: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    pub header: Header,
    #[serde(default)]
    pub parent_header: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<KernelChannel>,
    #[serde(skip)]
    pub buffers: Vec<Vec<u8>>,
}

/// Who is sending: stamped into every outbound header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub session: String,
    pub version: String,
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

impl KernelMessage {
    /// Build a message with a fresh `msg_id` and the current timestamp.
    pub fn new(identity: &Identity, channel: KernelChannel, msg_type: impl Into<String>, content: Value) -> Self {
        Self {
            header: Header {
                msg_id: Uuid::new_v4().to_string(),
                msg_type: msg_type.into(),
                username: identity.username.clone(),
                session: identity.session.clone(),
                date: now_rfc3339(),
                version: identity.version.clone(),
            },
            parent_header: Map::new(),
            metadata: Map::new(),
            content,
            channel: Some(channel),
            buffers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_buffers(mut self, buffers: Vec<Vec<u8>>) -> Self {
        self.buffers = buffers;
        self
    }

    #[must_use]
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Shell `comm_open` request.
    #[must_use]
    pub fn comm_open(identity: &Identity, target_name: &str, comm_id: &str, message: CommMessage) -> Self {
        let content = json!({ "comm_id": comm_id, "target_name": target_name, "data": message.data });
        Self::new(identity, KernelChannel::Shell, COMM_OPEN, content).with_buffers(message.buffers)
    }

    /// Shell `comm_msg` request.
    #[must_use]
    pub fn comm_msg(identity: &Identity, comm_id: &str, message: CommMessage) -> Self {
        let content = json!({ "comm_id": comm_id, "data": message.data });
        Self::new(identity, KernelChannel::Shell, COMM_MSG, content).with_buffers(message.buffers)
    }

    /// Shell `comm_close` request. Carries an empty data object.
    #[must_use]
    pub fn comm_close(identity: &Identity, comm_id: &str) -> Self {
        let content = json!({ "comm_id": comm_id, "data": {} });
        Self::new(identity, KernelChannel::Shell, COMM_CLOSE, content)
    }
}

// =============================================================================
// COMM CONTENTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommOpenContent {
    pub comm_id: String,
    pub target_name: String,
    #[serde(default)]
    pub data: Value,
}

/// Content of both `comm_msg` and `comm_close`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommContent {
    pub comm_id: String,
    #[serde(default)]
    pub data: Value,
}

fn parse<T: serde::de::DeserializeOwned>(message: &KernelMessage) -> Result<T, ProtocolError> {
    serde_json::from_value(message.content.clone())
        .map_err(|source| ProtocolError::InvalidContent { msg_type: message.msg_type().to_owned(), source })
}

/// Translate an IOPub message into a dispatcher notification. Messages
/// that are not comm traffic map to `Ok(None)`.
///
/// # Errors
///
/// Returns `ProtocolError::InvalidContent` when a comm message's content
/// does not carry the required fields.
pub fn to_notification(message: &KernelMessage) -> Result<Option<Notification>, ProtocolError> {
    let notification = match message.msg_type() {
        COMM_OPEN => {
            let content: CommOpenContent = parse(message)?;
            Notification::Open {
                target_name: content.target_name,
                comm_id: content.comm_id,
                message: CommMessage { data: content.data, buffers: message.buffers.clone() },
            }
        }
        COMM_MSG => {
            let content: CommContent = parse(message)?;
            Notification::Message {
                comm_id: content.comm_id,
                message: CommMessage { data: content.data, buffers: message.buffers.clone() },
            }
        }
        COMM_CLOSE => {
            let content: CommContent = parse(message)?;
            Notification::Close { comm_id: content.comm_id }
        }
        _ => return Ok(None),
    };
    Ok(Some(notification))
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
