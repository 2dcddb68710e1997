use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, SystemEvent, UserId},
    protocol::{ConversationPayload, LastMessagePayload, MessagePayload, ReadCursorPayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Optimistic echo of a send the server has not acknowledged yet.
    PendingLocal,
    Confirmed,
    /// The send request failed; the record stays visible with a retry affordance.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_username: Option<String>,
    pub body: String,
    pub reply_to: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl Message {
    pub fn local_echo(
        conversation_id: ConversationId,
        sender_id: UserId,
        body: impl Into<String>,
        reply_to: Option<MessageId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::local_echo(),
            conversation_id,
            sender_id,
            sender_username: None,
            body: body.into(),
            reply_to,
            created_at,
            delivery: DeliveryState::PendingLocal,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.delivery == DeliveryState::Confirmed
    }
}

impl From<MessagePayload> for Message {
    fn from(payload: MessagePayload) -> Self {
        Self {
            id: payload.message_id,
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            sender_username: payload.sender_username,
            body: payload.body,
            reply_to: payload.reply_to,
            created_at: payload.created_at,
            delivery: DeliveryState::Confirmed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    pub message_id: MessageId,
    pub body: String,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
    pub system_event: Option<SystemEvent>,
}

impl From<LastMessagePayload> for LastMessage {
    fn from(payload: LastMessagePayload) -> Self {
        Self {
            message_id: payload.message_id,
            body: payload.body,
            sender_id: payload.sender_id,
            created_at: payload.created_at,
            system_event: payload.system_event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCursor {
    pub message_id: MessageId,
    pub message_created_at: DateTime<Utc>,
}

impl From<ReadCursorPayload> for ReadCursor {
    fn from(payload: ReadCursorPayload) -> Self {
        Self {
            message_id: payload.message_id,
            message_created_at: payload.message_created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
    pub participant_count: usize,
    pub is_group: bool,
    pub name: Option<String>,
    pub group_picture: Option<String>,
    pub last_message: Option<LastMessage>,
    pub unread: bool,
    pub read_cursors: HashMap<UserId, ReadCursor>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSummary {
    /// Last-message timestamp, falling back to the conversation's own update time.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|last| last.created_at)
            .unwrap_or(self.updated_at)
    }
}

impl From<ConversationPayload> for ConversationSummary {
    fn from(payload: ConversationPayload) -> Self {
        Self {
            id: payload.conversation_id,
            participant_count: payload.participants.len(),
            participants: payload.participants,
            is_group: payload.is_group,
            name: payload.name,
            group_picture: payload.group_picture,
            last_message: payload.last_message.map(LastMessage::from),
            unread: payload.unread,
            read_cursors: payload
                .read_cursors
                .into_iter()
                .map(|(user_id, cursor)| (user_id, ReadCursor::from(cursor)))
                .collect(),
            updated_at: payload.updated_at,
        }
    }
}

/// Result of applying a mutation to one of the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The input was valid but changed nothing (older timestamp, unknown id).
    Unchanged,
    /// The same record was already present.
    DuplicateIgnored,
    /// The response belongs to a conversation that is no longer open.
    Stale,
}

impl Outcome {
    pub fn is_applied(self) -> bool {
        self == Self::Applied
    }
}
