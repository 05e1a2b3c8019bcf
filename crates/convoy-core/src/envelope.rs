//! Wire envelopes exchanged over the chat WebSocket.
//!
//! Every frame is a JSON object discriminated by `type`; payload fields are
//! camelCase. Decoding checks the discriminator against the known set first so
//! an unrecognised `type` is reported distinctly from a malformed payload.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ids::{ClientMessageId, ConversationId, MessageId, UserId};
use crate::model::{Message, MessageKind};

/// Client → server frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    #[serde(rename_all = "camelCase")]
    JoinConversation { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        #[serde(default = "default_message_type")]
        message_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<ClientMessageId>,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
}

fn default_message_type() -> String {
    MessageKind::Text.as_str().to_string()
}

impl ClientEnvelope {
    pub const TYPES: &'static [&'static str] = &["join_conversation", "send_message", "typing"];

    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        decode(raw, Self::TYPES)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::JoinConversation { .. } => "join_conversation",
            Self::SendMessage { .. } => "send_message",
            Self::Typing { .. } => "typing",
        }
    }
}

/// Server → client frames.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished { user_id: UserId },
    #[serde(rename_all = "camelCase")]
    ConversationJoined { conversation_id: ConversationId },
    #[serde(rename_all = "camelCase")]
    NewMessage {
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_name: String,
        content: String,
        message_type: MessageKind,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    TypingIndicator {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    /// Persistence acknowledgement sent back to the sender only.
    #[serde(rename_all = "camelCase")]
    MessageSent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<ClientMessageId>,
        id: MessageId,
        conversation_id: ConversationId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_message_id: Option<ClientMessageId>,
    },
}

impl ServerEnvelope {
    pub const TYPES: &'static [&'static str] = &[
        "connection_established",
        "conversation_joined",
        "new_message",
        "typing_indicator",
        "message_sent",
        "error",
    ];

    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        decode(raw, Self::TYPES)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn new_message(message: &Message, sender_name: impl Into<String>) -> Self {
        Self::NewMessage {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender_name: sender_name.into(),
            content: message.content.clone(),
            message_type: message.kind,
            timestamp: message.created_at,
        }
    }

    pub fn message_sent(message: &Message) -> Self {
        Self::MessageSent {
            client_message_id: message.client_message_id.clone(),
            id: message.id,
            conversation_id: message.conversation_id,
            timestamp: message.created_at,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: None,
            client_message_id: None,
        }
    }

    pub fn error_with_code(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code.to_string()),
            client_message_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Missing message type")]
    MissingType,
    #[error("Unknown message type")]
    UnknownType(String),
    #[error("Invalid {kind} payload: {detail}")]
    Malformed { kind: String, detail: String },
}

fn decode<T: DeserializeOwned>(raw: &str, known: &[&str]) -> Result<T, EnvelopeError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(EnvelopeError::MissingType)?
        .to_string();
    if !known.contains(&kind.as_str()) {
        return Err(EnvelopeError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed {
        kind,
        detail: e.to_string(),
    })
}
