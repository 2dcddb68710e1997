//! Single-flight guard for read-receipt submissions, one state machine per
//! conversation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{ConversationId, MessageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRead {
    pub message_id: MessageId,
    pub message_created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    InFlight(MessageId),
}

#[derive(Debug, Clone, Default)]
struct ConversationReadState {
    recorded: Option<RecordedRead>,
    phase: Phase,
}

#[derive(Debug, Default, Clone)]
pub struct ReadCursorTracker {
    conversations: HashMap<ConversationId, ConversationReadState>,
}

impl ReadCursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_mark_read(&self, candidate: &MessageId, conversation_id: &ConversationId) -> bool {
        if candidate.is_local_echo() {
            return false;
        }
        let Some(state) = self.conversations.get(conversation_id) else {
            return true;
        };
        if state.phase != Phase::Idle {
            return false;
        }
        state
            .recorded
            .as_ref()
            .map_or(true, |recorded| &recorded.message_id != candidate)
    }

    /// Claims the single-flight slot. Returns false when the submission must
    /// not be sent.
    pub fn begin(&mut self, candidate: &MessageId, conversation_id: &ConversationId) -> bool {
        if !self.should_mark_read(candidate, conversation_id) {
            return false;
        }
        self.conversations
            .entry(conversation_id.clone())
            .or_default()
            .phase = Phase::InFlight(candidate.clone());
        true
    }

    pub fn in_flight(&self, conversation_id: &ConversationId) -> Option<&MessageId> {
        match &self.conversations.get(conversation_id)?.phase {
            Phase::InFlight(message_id) => Some(message_id),
            Phase::Idle => None,
        }
    }

    pub fn recorded(&self, conversation_id: &ConversationId) -> Option<&RecordedRead> {
        self.conversations.get(conversation_id)?.recorded.as_ref()
    }

    /// Records the server-acknowledged read and releases the slot. The
    /// recorded pair never moves to an older message.
    pub fn succeeded(&mut self, conversation_id: &ConversationId, acked: RecordedRead) {
        let state = self.conversations.entry(conversation_id.clone()).or_default();
        state.phase = Phase::Idle;
        advance(&mut state.recorded, acked);
    }

    /// Releases the slot without recording, so the next trigger retries.
    pub fn failed(&mut self, conversation_id: &ConversationId) {
        if let Some(state) = self.conversations.get_mut(conversation_id) {
            state.phase = Phase::Idle;
        }
    }

    /// Adopts the viewer's own cursor as reported by the server, e.g. after a
    /// read on another device.
    pub fn observe_server_cursor(&mut self, conversation_id: &ConversationId, cursor: RecordedRead) {
        let state = self.conversations.entry(conversation_id.clone()).or_default();
        advance(&mut state.recorded, cursor);
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
    }
}

fn advance(recorded: &mut Option<RecordedRead>, next: RecordedRead) {
    match recorded {
        Some(current) if current.message_created_at > next.message_created_at => {}
        _ => *recorded = Some(next),
    }
}

#[cfg(test)]
#[path = "tests/read_cursor_tests.rs"]
mod tests;
