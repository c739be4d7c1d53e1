//! JSON frames exchanged over the chat websocket
//!
//! The router treats payloads as opaque bytes; these envelopes only exist at
//! the presentation edge.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Message kind used when the client does not send one
pub const MSG_TYPE_TEXT: i16 = 0;

/// Client-to-server frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Subscribe to a conversation
    Join {
        #[serde(default)]
        conversation_id: String,
    },

    /// Unsubscribe from a conversation
    Leave {
        #[serde(default)]
        conversation_id: String,
    },

    /// Post a message to a conversation
    Message(MessageDraft),

    #[serde(other)]
    Unsupported,
}

impl ClientFrame {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Fields of an inbound message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(default)]
    pub conversation_id: String,
    pub body: Option<String>,
    pub msg_type: Option<i16>,
    pub attachment_url: Option<String>,
    pub attachment_meta: Option<String>,
    pub dedupe_key: Option<String>,
}

/// A message as fanned out to conversation members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub conversation_id: String,
    pub sender_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub msg_type: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_meta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

impl ChatMessage {
    /// Stamp a draft with a fresh id and the current time
    pub fn from_draft(sender_id: String, draft: MessageDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: draft.conversation_id,
            sender_id,
            created_at: Utc::now(),
            body: draft.body,
            msg_type: draft.msg_type.unwrap_or(MSG_TYPE_TEXT),
            attachment_url: draft.attachment_url,
            attachment_meta: draft.attachment_meta,
            dedupe_key: draft.dedupe_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    UnsupportedType,
    InternalError,
    ReadError,
}

/// Server-to-client frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected,
    Joined { conversation_id: String },
    Left { conversation_id: String },
    Message {
        conversation_id: String,
        message: ChatMessage,
    },
    Error { code: ErrorCode, error: String },
}

impl ServerFrame {
    pub fn error(code: ErrorCode, error: impl Into<String>) -> Self {
        Self::Error {
            code,
            error: error.into(),
        }
    }

    /// Serialize into a payload ready for the router
    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}
