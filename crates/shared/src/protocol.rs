use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, MessageId, SystemEvent, UserId},
    error::ApiError,
};

/// Control events the client sends over the event channel. Both are scoping
/// hints for the server; delivery does not depend on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinConversation { conversation_id: ConversationId },
    LeaveConversation { conversation_id: ConversationId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessagePayload {
    pub message_id: MessageId,
    pub body: String,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_event: Option<SystemEvent>,
}

impl From<&MessagePayload> for LastMessagePayload {
    fn from(message: &MessagePayload) -> Self {
        Self {
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            sender_id: message.sender_id.clone(),
            created_at: message.created_at,
            system_event: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadCursorPayload {
    pub message_id: MessageId,
    pub message_created_at: DateTime<Utc>,
}

/// Full conversation summary as returned by the conversation list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub conversation_id: ConversationId,
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessagePayload>,
    #[serde(default)]
    pub unread: bool,
    #[serde(default)]
    pub read_cursors: HashMap<UserId, ReadCursorPayload>,
    pub updated_at: DateTime<Utc>,
}

/// Partial conversation state pushed over the event channel. Every field
/// except the id is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationUpdatePayload {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_cursors: Option<HashMap<UserId, ReadCursorPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ConversationUpdatePayload {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadAck {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub message_created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage { message: MessagePayload },
    ConversationUpdated { update: ConversationUpdatePayload },
    Error(ApiError),
}

impl ServerEvent {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::NewMessage { message } => Some(&message.conversation_id),
            Self::ConversationUpdated { update } => Some(&update.conversation_id),
            Self::Error(_) => None,
        }
    }
}
