//! Computes the next store state from local intents and inbound events.
//!
//! The reconciler is the only owner of the message list, the summary list
//! and the read-cursor tracker. It performs no I/O: every method returns the
//! [`Effect`]s the caller has to carry out (requests to send, control events
//! to emit, view hints). Every supersede decision compares the timestamps
//! embedded in payloads; arrival order is never trusted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{
        ClientRequest, ConversationUpdatePayload, MarkReadAck, MarkReadRequest, MessagePage,
        MessagePayload, SendMessageRequest, ServerEvent,
    },
};
use tracing::{debug, warn};

use crate::{
    error::ClientError,
    message_store::MessageStore,
    read_cursor::{ReadCursorTracker, RecordedRead},
    summary_store::{advance_read_cursor, ConversationSummaryStore, MergeContext, SummaryEvent},
    types::{ConversationSummary, Message, Outcome, ReadCursor},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Submit a read receipt. The tracker slot for the conversation is held
    /// until `mark_read_succeeded` or `mark_read_failed` is called.
    MarkRead(MarkReadRequest),
    FetchPage {
        conversation_id: ConversationId,
        before: Option<DateTime<Utc>>,
    },
    Control(ClientRequest),
    ScrollToBottom,
    ReadCursorsChanged { conversation_id: ConversationId },
    MessagesChanged,
    SummariesChanged,
}

/// Read-only copy of the reconciled state handed to views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub open_conversation: Option<ConversationId>,
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub read_cursors: HashMap<UserId, ReadCursor>,
    pub summaries: Vec<ConversationSummary>,
}

#[derive(Debug)]
pub struct Reconciler {
    viewer: UserId,
    open_conversation: Option<ConversationId>,
    at_bottom: bool,
    page_in_flight: bool,
    messages: MessageStore,
    summaries: ConversationSummaryStore,
    read_cursor: ReadCursorTracker,
    open_read_cursors: HashMap<UserId, ReadCursor>,
}

impl Reconciler {
    pub fn new(viewer: UserId) -> Self {
        Self {
            viewer,
            open_conversation: None,
            at_bottom: true,
            page_in_flight: false,
            messages: MessageStore::new(),
            summaries: ConversationSummaryStore::new(),
            read_cursor: ReadCursorTracker::new(),
            open_read_cursors: HashMap::new(),
        }
    }

    pub fn viewer(&self) -> &UserId {
        &self.viewer
    }

    pub fn open_conversation(&self) -> Option<&ConversationId> {
        self.open_conversation.as_ref()
    }

    pub fn is_at_bottom(&self) -> bool {
        self.at_bottom
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn summaries(&self) -> &ConversationSummaryStore {
        &self.summaries
    }

    pub fn read_cursor(&self) -> &ReadCursorTracker {
        &self.read_cursor
    }

    pub fn open_read_cursors(&self) -> &HashMap<UserId, ReadCursor> {
        &self.open_read_cursors
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            open_conversation: self.open_conversation.clone(),
            messages: self.messages.messages().to_vec(),
            has_more: self.messages.has_more(),
            read_cursors: self.open_read_cursors.clone(),
            summaries: self.summaries.summaries().to_vec(),
        }
    }

    /// Errors unless `conversation_id` is the open conversation.
    pub fn ensure_current(&self, conversation_id: &ConversationId) -> Result<(), ClientError> {
        if self.open_conversation.as_ref() == Some(conversation_id) {
            Ok(())
        } else {
            Err(ClientError::StaleResponse {
                conversation_id: conversation_id.clone(),
            })
        }
    }

    pub fn replace_summaries(&mut self, summaries: Vec<ConversationSummary>) -> Vec<Effect> {
        self.summaries.replace_all(summaries);
        if let Some(open) = self.open_conversation.clone() {
            self.summaries.mark_read_locally(&open);
            self.load_open_read_cursors();
        }
        vec![Effect::SummariesChanged]
    }

    /// Switches context. The message list is dropped and refetched even when
    /// the same conversation is reopened, which is how missed events are
    /// recovered.
    pub fn open_conversation_with(&mut self, conversation_id: ConversationId) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(previous) = self.open_conversation.take() {
            if previous != conversation_id {
                effects.push(Effect::Control(ClientRequest::LeaveConversation {
                    conversation_id: previous,
                }));
            }
        }

        self.open_conversation = Some(conversation_id.clone());
        self.at_bottom = true;
        self.page_in_flight = true;
        self.messages.reset(Some(conversation_id.clone()));
        self.load_open_read_cursors();
        if self.summaries.mark_read_locally(&conversation_id).is_applied() {
            effects.push(Effect::SummariesChanged);
        }

        effects.push(Effect::Control(ClientRequest::JoinConversation {
            conversation_id: conversation_id.clone(),
        }));
        effects.push(Effect::FetchPage {
            conversation_id,
            before: None,
        });
        effects.push(Effect::MessagesChanged);
        effects
    }

    pub fn close_conversation(&mut self) -> Vec<Effect> {
        let Some(previous) = self.open_conversation.take() else {
            return Vec::new();
        };
        self.messages.reset(None);
        self.open_read_cursors.clear();
        self.page_in_flight = false;
        vec![
            Effect::Control(ClientRequest::LeaveConversation {
                conversation_id: previous,
            }),
            Effect::MessagesChanged,
        ]
    }

    /// Returns the fetch for the next older page, if there is one and no
    /// page request is outstanding.
    pub fn request_older_page(&mut self) -> Option<Effect> {
        let conversation_id = self.open_conversation.clone()?;
        if self.page_in_flight || !self.messages.has_more() {
            return None;
        }
        self.page_in_flight = true;
        Some(Effect::FetchPage {
            conversation_id,
            before: self.messages.next_cursor(),
        })
    }

    pub fn apply_page(
        &mut self,
        conversation_id: &ConversationId,
        page: MessagePage,
        before: Option<DateTime<Utc>>,
    ) -> (Outcome, Vec<Effect>) {
        if self.ensure_current(conversation_id).is_err() {
            debug!(%conversation_id, "discarding page for a conversation no longer open");
            return (Outcome::Stale, Vec::new());
        }
        self.page_in_flight = false;

        let outcome = self
            .messages
            .apply_page(conversation_id, page, before.is_some());
        let mut effects = vec![Effect::MessagesChanged];
        if before.is_none() && self.at_bottom {
            effects.extend(self.request_mark_read());
        }
        (outcome, effects)
    }

    pub fn page_failed(&mut self, conversation_id: &ConversationId) {
        if self.ensure_current(conversation_id).is_ok() {
            self.page_in_flight = false;
        }
    }

    /// Creates the optimistic echo for a send and the request that carries it.
    pub fn begin_send(
        &mut self,
        body: &str,
        reply_to: Option<MessageId>,
        now: DateTime<Utc>,
    ) -> Result<(Message, SendMessageRequest), ClientError> {
        let conversation_id = self
            .open_conversation
            .clone()
            .ok_or(ClientError::NoOpenConversation)?;
        let echo = Message::local_echo(
            conversation_id.clone(),
            self.viewer.clone(),
            body,
            reply_to.clone(),
            now,
        );
        self.messages.append_local_echo(echo.clone());
        let request = SendMessageRequest {
            conversation_id,
            body: body.to_string(),
            reply_to,
        };
        Ok((echo, request))
    }

    /// Swaps the echo for the server's record. The inbox is updated even if
    /// the user has meanwhile switched to another conversation.
    pub fn confirm_send(&mut self, local_id: &MessageId, confirmed: MessagePayload) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.ensure_current(&confirmed.conversation_id).is_ok() {
            let server_message = Message::from(confirmed.clone());
            let outcome = match self.messages.confirm(local_id, server_message.clone()) {
                // The echo was dropped by a reload while the send was in flight.
                Outcome::Unchanged => self.messages.insert_incoming(server_message),
                outcome => outcome,
            };
            if outcome != Outcome::Unchanged {
                effects.push(Effect::MessagesChanged);
            }
        }

        let ctx = MergeContext {
            viewer: &self.viewer,
            open_conversation: self.open_conversation.as_ref(),
        };
        if self
            .summaries
            .merge_incoming(SummaryEvent::NewMessage(&confirmed), ctx)
            .is_applied()
        {
            effects.push(Effect::SummariesChanged);
        }
        effects
    }

    pub fn fail_send(&mut self, local_id: &MessageId) -> Vec<Effect> {
        if self.messages.mark_failed(local_id).is_applied() {
            vec![Effect::MessagesChanged]
        } else {
            Vec::new()
        }
    }

    /// Re-issues the original request for a failed echo.
    pub fn retry_send(&mut self, local_id: &MessageId) -> Result<SendMessageRequest, ClientError> {
        let echo = self
            .messages
            .take_for_retry(local_id)
            .ok_or_else(|| ClientError::UnknownLocalEcho(local_id.to_string()))?;
        Ok(SendMessageRequest {
            conversation_id: echo.conversation_id,
            body: echo.body,
            reply_to: echo.reply_to,
        })
    }

    pub fn set_viewport_at_bottom(&mut self, at_bottom: bool) -> Vec<Effect> {
        let reached_bottom = at_bottom && !self.at_bottom;
        self.at_bottom = at_bottom;
        if reached_bottom {
            self.request_mark_read().into_iter().collect()
        } else {
            Vec::new()
        }
    }

    /// Claims the read-receipt slot for the newest displayed message, if a
    /// submission is due.
    pub fn request_mark_read(&mut self) -> Option<Effect> {
        let conversation_id = self.open_conversation.clone()?;
        let candidate = self.messages.newest_confirmed()?.id.clone();
        if !self.read_cursor.begin(&candidate, &conversation_id) {
            return None;
        }
        Some(Effect::MarkRead(MarkReadRequest {
            conversation_id,
            message_id: candidate,
        }))
    }

    pub fn mark_read_succeeded(&mut self, ack: MarkReadAck) -> (Outcome, Vec<Effect>) {
        let recorded = RecordedRead {
            message_id: ack.message_id.clone(),
            message_created_at: ack.message_created_at,
        };
        self.read_cursor.succeeded(&ack.conversation_id, recorded);

        let mut effects = Vec::new();
        let cursor = ReadCursor {
            message_id: ack.message_id.clone(),
            message_created_at: ack.message_created_at,
        };
        if self
            .summaries
            .mark_read_locally(&ack.conversation_id)
            .is_applied()
        {
            effects.push(Effect::SummariesChanged);
        }

        if self.ensure_current(&ack.conversation_id).is_err() {
            return (Outcome::Stale, effects);
        }
        if advance_read_cursor(&mut self.open_read_cursors, &self.viewer, cursor) {
            effects.push(Effect::ReadCursorsChanged {
                conversation_id: ack.conversation_id.clone(),
            });
        }

        // Messages that arrived while this receipt was in flight were held
        // back by the single-flight guard.
        let newer_displayed = self
            .messages
            .newest_confirmed()
            .is_some_and(|newest| newest.id != ack.message_id);
        if self.at_bottom && newer_displayed {
            effects.extend(self.request_mark_read());
        }
        (Outcome::Applied, effects)
    }

    pub fn mark_read_failed(&mut self, conversation_id: &ConversationId) {
        self.read_cursor.failed(conversation_id);
    }

    pub fn apply_event(&mut self, event: ServerEvent) -> Vec<Effect> {
        match event {
            ServerEvent::NewMessage { message } => self.apply_new_message(message),
            ServerEvent::ConversationUpdated { update } => self.apply_conversation_update(update),
            ServerEvent::Error(err) => {
                warn!(code = ?err.code, message = %err.message, "server reported an error");
                Vec::new()
            }
        }
    }

    fn apply_new_message(&mut self, message: MessagePayload) -> Vec<Effect> {
        let mut effects = Vec::new();
        let is_open = self.open_conversation.as_ref() == Some(&message.conversation_id);
        let from_viewer = message.sender_id == self.viewer;

        // The viewer's own messages are represented by the echo until the
        // send response confirms it.
        if is_open && !from_viewer {
            match self.messages.insert_incoming(Message::from(message.clone())) {
                Outcome::Applied => {
                    effects.push(Effect::MessagesChanged);
                    if self.at_bottom {
                        effects.extend(self.request_mark_read());
                        effects.push(Effect::ScrollToBottom);
                    }
                }
                Outcome::DuplicateIgnored => {
                    debug!(message_id = %message.message_id, "duplicate new_message ignored");
                }
                Outcome::Unchanged | Outcome::Stale => {}
            }
        }

        let ctx = MergeContext {
            viewer: &self.viewer,
            open_conversation: self.open_conversation.as_ref(),
        };
        if self
            .summaries
            .merge_incoming(SummaryEvent::NewMessage(&message), ctx)
            .is_applied()
        {
            effects.push(Effect::SummariesChanged);
        }
        effects
    }

    fn apply_conversation_update(&mut self, update: ConversationUpdatePayload) -> Vec<Effect> {
        let mut effects = Vec::new();
        let ctx = MergeContext {
            viewer: &self.viewer,
            open_conversation: self.open_conversation.as_ref(),
        };
        if self
            .summaries
            .merge_incoming(SummaryEvent::Updated(&update), ctx)
            .is_applied()
        {
            effects.push(Effect::SummariesChanged);
        }

        if self.open_conversation.as_ref() != Some(&update.conversation_id) {
            return effects;
        }
        let Some(cursors) = update.read_cursors else {
            return effects;
        };

        let mut cursors_changed = false;
        for (user_id, cursor) in cursors {
            let cursor = ReadCursor::from(cursor);
            if user_id == self.viewer {
                self.read_cursor.observe_server_cursor(
                    &update.conversation_id,
                    RecordedRead {
                        message_id: cursor.message_id.clone(),
                        message_created_at: cursor.message_created_at,
                    },
                );
            }
            cursors_changed |= advance_read_cursor(&mut self.open_read_cursors, &user_id, cursor);
        }
        if cursors_changed {
            effects.push(Effect::ReadCursorsChanged {
                conversation_id: update.conversation_id,
            });
        }
        effects
    }

    fn load_open_read_cursors(&mut self) {
        self.open_read_cursors = self
            .open_conversation
            .as_ref()
            .and_then(|id| self.summaries.get(id))
            .map(|summary| summary.read_cursors.clone())
            .unwrap_or_default();
    }

    /// Drops all session state; used on logout.
    pub fn reset(&mut self) {
        self.open_conversation = None;
        self.at_bottom = true;
        self.page_in_flight = false;
        self.messages.reset(None);
        self.summaries.clear();
        self.read_cursor.clear();
        self.open_read_cursors.clear();
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
