//! Inbox-side conversation summaries.

use std::collections::HashMap;

use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationUpdatePayload, MessagePayload},
};
use tracing::debug;

use crate::types::{ConversationSummary, LastMessage, Outcome, ReadCursor};

/// Inbound change routed to [`ConversationSummaryStore::merge_incoming`].
#[derive(Debug, Clone, Copy)]
pub enum SummaryEvent<'a> {
    NewMessage(&'a MessagePayload),
    Updated(&'a ConversationUpdatePayload),
}

impl SummaryEvent<'_> {
    fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::NewMessage(message) => &message.conversation_id,
            Self::Updated(update) => &update.conversation_id,
        }
    }
}

/// Who is looking and at what; decides the unread flag.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    pub viewer: &'a UserId,
    pub open_conversation: Option<&'a ConversationId>,
}

#[derive(Debug, Default, Clone)]
pub struct ConversationSummaryStore {
    summaries: Vec<ConversationSummary>,
}

impl ConversationSummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&mut self, summaries: Vec<ConversationSummary>) {
        self.summaries = summaries;
        self.resort();
    }

    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.summaries
    }

    pub fn get(&self, id: &ConversationId) -> Option<&ConversationSummary> {
        self.summaries.iter().find(|summary| &summary.id == id)
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.summaries.iter().filter(|summary| summary.unread).count()
    }

    pub fn clear(&mut self) {
        self.summaries.clear();
    }

    pub fn mark_read_locally(&mut self, id: &ConversationId) -> Outcome {
        match self.summaries.iter_mut().find(|summary| &summary.id == id) {
            Some(summary) if summary.unread => {
                summary.unread = false;
                Outcome::Applied
            }
            _ => Outcome::Unchanged,
        }
    }

    /// Folds a new message or a conversation update into the matching
    /// summary. Conversations not present locally are left alone; the list
    /// only grows through [`Self::replace_all`].
    pub fn merge_incoming(&mut self, event: SummaryEvent<'_>, ctx: MergeContext<'_>) -> Outcome {
        let conversation_id = event.conversation_id();
        let Some(summary) = self
            .summaries
            .iter_mut()
            .find(|summary| &summary.id == conversation_id)
        else {
            debug!(%conversation_id, "event for unknown conversation left for the next reload");
            return Outcome::Unchanged;
        };

        let changed = match event {
            SummaryEvent::NewMessage(message) => {
                let last = LastMessage {
                    message_id: message.message_id.clone(),
                    body: message.body.clone(),
                    sender_id: message.sender_id.clone(),
                    created_at: message.created_at,
                    system_event: None,
                };
                apply_last_message(summary, last, ctx)
            }
            SummaryEvent::Updated(update) => apply_update(summary, update, ctx),
        };

        if changed {
            self.resort();
            Outcome::Applied
        } else {
            Outcome::Unchanged
        }
    }

    fn resort(&mut self) {
        self.summaries.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}

// Timestamp guard: the incoming snapshot wins when it is not older.
fn apply_last_message(
    summary: &mut ConversationSummary,
    incoming: LastMessage,
    ctx: MergeContext<'_>,
) -> bool {
    if let Some(current) = &summary.last_message {
        if incoming.created_at < current.created_at {
            debug!(
                conversation_id = %summary.id,
                incoming = %incoming.message_id,
                current = %current.message_id,
                "older last message ignored"
            );
            return false;
        }
        // Redelivery of the current last message must not resurrect unread.
        if incoming.message_id == current.message_id {
            let changed = *current != incoming;
            summary.last_message = Some(incoming);
            return changed;
        }
    }

    let is_open = ctx.open_conversation == Some(&summary.id);
    summary.unread = &incoming.sender_id != ctx.viewer && !is_open;
    summary.last_message = Some(incoming);
    true
}

fn apply_update(
    summary: &mut ConversationSummary,
    update: &ConversationUpdatePayload,
    ctx: MergeContext<'_>,
) -> bool {
    let mut changed = false;

    if let Some(participants) = &update.participants {
        summary.participant_count = participants.len();
        summary.participants = participants.clone();
        changed = true;
    }
    if let Some(count) = update.participant_count {
        summary.participant_count = count as usize;
        changed = true;
    }
    if let Some(name) = &update.name {
        summary.name = Some(name.clone());
        changed = true;
    }
    if let Some(picture) = &update.group_picture {
        summary.group_picture = Some(picture.clone());
        changed = true;
    }
    if let Some(updated_at) = update.updated_at {
        if updated_at > summary.updated_at {
            summary.updated_at = updated_at;
            changed = true;
        }
    }
    if let Some(cursors) = &update.read_cursors {
        for (user_id, cursor) in cursors {
            changed |= advance_read_cursor(
                &mut summary.read_cursors,
                user_id,
                ReadCursor::from(cursor.clone()),
            );
        }
    }
    if let Some(last) = &update.last_message {
        changed |= apply_last_message(summary, LastMessage::from(last.clone()), ctx);
    }

    changed
}

/// Moves a participant's read cursor forward; never back.
pub(crate) fn advance_read_cursor(
    cursors: &mut HashMap<UserId, ReadCursor>,
    user_id: &UserId,
    cursor: ReadCursor,
) -> bool {
    match cursors.get(user_id) {
        Some(current) if current.message_created_at > cursor.message_created_at => false,
        Some(current) if current == &cursor => false,
        _ => {
            cursors.insert(user_id.clone(), cursor);
            true
        }
    }
}

#[cfg(test)]
#[path = "tests/summary_store_tests.rs"]
mod tests;
