//! Ordered message list for the open conversation.
//!
//! Messages are kept newest first. Confirmed messages stay ordered by
//! creation timestamp; an echo keeps the slot it was given when the send was
//! initiated, including after it is confirmed.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId},
    protocol::MessagePage,
};
use tracing::debug;

use crate::types::{DeliveryState, Message, Outcome};

#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    next_cursor: Option<DateTime<Utc>>,
    has_more: bool,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every record and scopes the store to `conversation_id`.
    pub fn reset(&mut self, conversation_id: Option<ConversationId>) {
        self.conversation_id = conversation_id;
        self.messages.clear();
        self.next_cursor = None;
        self.has_more = false;
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn next_cursor(&self) -> Option<DateTime<Utc>> {
        self.next_cursor
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    /// Newest message that carries a durable server id.
    pub fn newest_confirmed(&self) -> Option<&Message> {
        self.messages.iter().find(|message| message.is_confirmed())
    }

    /// Applies a fetched history page. A page fetched without a cursor
    /// replaces the list; a page fetched with one is merged at the old end.
    pub fn apply_page(
        &mut self,
        conversation_id: &ConversationId,
        page: MessagePage,
        had_cursor: bool,
    ) -> Outcome {
        if self.conversation_id.as_ref() != Some(conversation_id) {
            return Outcome::Stale;
        }

        let fetched: Vec<Message> = page.messages.into_iter().map(Message::from).collect();
        if had_cursor {
            self.prepend(fetched);
        } else {
            // Echoes are the only records a fresh page cannot know about.
            let echoes: Vec<Message> = self
                .messages
                .drain(..)
                .filter(|message| !message.is_confirmed())
                .collect();
            self.messages = echoes;
            let mut fetched = fetched;
            fetched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            for message in fetched {
                if !self.contains(&message.id) {
                    self.messages.push(message);
                }
            }
        }

        self.next_cursor = page.next_cursor;
        self.has_more = page.has_more;
        Outcome::Applied
    }

    /// Places an optimistic echo at the head of the list.
    pub fn append_local_echo(&mut self, message: Message) -> Outcome {
        if self.conversation_id.as_ref() != Some(&message.conversation_id) {
            return Outcome::Stale;
        }
        if self.contains(&message.id) {
            return Outcome::DuplicateIgnored;
        }
        self.messages.insert(0, message);
        Outcome::Applied
    }

    /// Replaces the echo `local_id` with the server's record, in place.
    pub fn confirm(&mut self, local_id: &MessageId, server_message: Message) -> Outcome {
        let Some(index) = self.position(local_id) else {
            return Outcome::Unchanged;
        };

        if let Some(existing) = self.position(&server_message.id) {
            if existing != index {
                // The confirmed record reached us through another path first.
                debug!(message_id = %server_message.id, "dropping echo already superseded");
                self.messages.remove(index);
                return Outcome::DuplicateIgnored;
            }
        }

        let mut confirmed = server_message;
        confirmed.delivery = DeliveryState::Confirmed;
        self.messages[index] = confirmed;
        Outcome::Applied
    }

    pub fn mark_failed(&mut self, local_id: &MessageId) -> Outcome {
        match self.messages.iter_mut().find(|message| &message.id == local_id) {
            Some(message) if message.delivery == DeliveryState::PendingLocal => {
                message.delivery = DeliveryState::Failed;
                Outcome::Applied
            }
            _ => Outcome::Unchanged,
        }
    }

    /// Flips a failed echo back to pending and returns it for resending.
    pub fn take_for_retry(&mut self, local_id: &MessageId) -> Option<Message> {
        let message = self
            .messages
            .iter_mut()
            .find(|message| &message.id == local_id)?;
        if message.delivery != DeliveryState::Failed {
            return None;
        }
        message.delivery = DeliveryState::PendingLocal;
        Some(message.clone())
    }

    /// Merges an older page at the old end of the list. Ids already present
    /// keep their current entry. Returns the number of records added.
    pub fn prepend(&mut self, older: Vec<Message>) -> usize {
        let mut older = older;
        older.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let mut added = 0;
        for message in older {
            if self.contains(&message.id) {
                debug!(message_id = %message.id, "skipping overlapping history entry");
                continue;
            }
            let index = self.insertion_index(message.created_at);
            self.messages.insert(index, message);
            added += 1;
        }
        added
    }

    /// Inserts a server-pushed message if it belongs to the open conversation
    /// and is not already present.
    pub fn insert_incoming(&mut self, message: Message) -> Outcome {
        if self.conversation_id.as_ref() != Some(&message.conversation_id) {
            return Outcome::Unchanged;
        }
        if self.contains(&message.id) {
            debug!(message_id = %message.id, "duplicate delivery ignored");
            return Outcome::DuplicateIgnored;
        }
        let index = self.insertion_index(message.created_at);
        self.messages.insert(index, message);
        Outcome::Applied
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }

    // Newest first: a new record goes above everything not newer than it.
    fn insertion_index(&self, created_at: DateTime<Utc>) -> usize {
        self.messages
            .iter()
            .position(|message| message.created_at <= created_at)
            .unwrap_or(self.messages.len())
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
