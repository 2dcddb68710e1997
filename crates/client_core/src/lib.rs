use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{MarkReadRequest, SendMessageRequest, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod error;
pub mod message_store;
pub mod read_cursor;
pub mod reconciler;
pub mod summary_store;
pub mod transport;
pub mod types;

pub use api::{ChatApi, HttpChatApi};
pub use config::ClientSettings;
pub use error::ClientError;
pub use reconciler::{Effect, Reconciler, Snapshot};
pub use transport::{EventChannel, EventChannelAdapter, EventName, SessionIdentity};
pub use types::{ConversationSummary, DeliveryState, Message, Outcome, ReadCursor};

use crate::error::Result;

/// Notifications for views. Views re-read [`ClientHandle::snapshot`] on
/// the `*Changed` variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    MessagesChanged,
    SummariesChanged,
    ReadCursorsChanged {
        conversation_id: ConversationId,
    },
    ScrollToBottom,
    SendFailed {
        local_id: MessageId,
        message: String,
        retryable: bool,
    },
    Error(String),
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn login(&self, server_url: &str, username: &str) -> Result<UserId>;
    async fn logout(&self);
    async fn refresh_conversations(&self) -> Result<()>;
    async fn open_conversation(&self, conversation_id: ConversationId) -> Result<()>;
    async fn close_conversation(&self) -> Result<()>;
    /// Fetches the next older page; returns false when there is nothing to load.
    async fn load_older_messages(&self) -> Result<bool>;
    /// Sends `body` to the open conversation and returns the confirmed id.
    async fn send_message(&self, body: &str, reply_to: Option<MessageId>) -> Result<MessageId>;
    async fn retry_send(&self, local_id: &MessageId) -> Result<MessageId>;
    async fn set_viewport_at_bottom(&self, at_bottom: bool) -> Result<()>;
    async fn mark_newest_read(&self) -> Result<()>;
    async fn snapshot(&self) -> Option<Snapshot>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

struct SessionState {
    identity: SessionIdentity,
    reconciler: Reconciler,
    channel: Option<Arc<EventChannel>>,
    event_pump: Option<JoinHandle<()>>,
}

pub struct ChatClient {
    api: Arc<dyn ChatApi>,
    channels: EventChannelAdapter,
    page_size: u32,
    inner: Mutex<Option<SessionState>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(settings: &ClientSettings) -> Result<Arc<Self>> {
        let api = HttpChatApi::new(settings.request_timeout)?;
        Ok(Self::new_with_api(settings, Arc::new(api)))
    }

    pub fn new_with_api(settings: &ClientSettings, api: Arc<dyn ChatApi>) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer);
        Arc::new(Self {
            api,
            channels: EventChannelAdapter::new(settings.reconnect_delay),
            page_size: settings.page_size,
            inner: Mutex::new(None),
            events,
        })
    }

    async fn session(&self) -> Result<SessionIdentity> {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|state| state.identity.clone())
            .ok_or(ClientError::NotLoggedIn)
    }

    /// Runs `apply` against the reconciler under the lock and hands back the
    /// current channel for effect execution.
    async fn reconcile<T>(
        &self,
        apply: impl FnOnce(&mut Reconciler) -> T,
    ) -> Result<(T, Option<Arc<EventChannel>>)> {
        let mut guard = self.inner.lock().await;
        let state = guard.as_mut().ok_or(ClientError::NotLoggedIn)?;
        let value = apply(&mut state.reconciler);
        Ok((value, state.channel.clone()))
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn perform_effects(self: &Arc<Self>, channel: Option<&EventChannel>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::MarkRead(request) => {
                    let client = Arc::clone(self);
                    tokio::spawn(async move {
                        client.submit_mark_read(request).await;
                    });
                }
                Effect::FetchPage {
                    conversation_id,
                    before,
                } => {
                    let client = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = client.fetch_page(conversation_id, before).await {
                            client.emit(ClientEvent::Error(err.to_string()));
                        }
                    });
                }
                Effect::Control(request) => match channel {
                    Some(channel) => {
                        if let Err(err) = channel.emit(request) {
                            debug!("control event not sent: {err}");
                        }
                    }
                    None => debug!(?request, "no event channel for control event"),
                },
                Effect::ScrollToBottom => self.emit(ClientEvent::ScrollToBottom),
                Effect::ReadCursorsChanged { conversation_id } => {
                    self.emit(ClientEvent::ReadCursorsChanged { conversation_id })
                }
                Effect::MessagesChanged => self.emit(ClientEvent::MessagesChanged),
                Effect::SummariesChanged => self.emit(ClientEvent::SummariesChanged),
            }
        }
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        if let ServerEvent::Error(err) = &event {
            self.emit(ClientEvent::Error(err.to_string()));
        }
        match self.reconcile(|reconciler| reconciler.apply_event(event)).await {
            Ok((effects, channel)) => self.perform_effects(channel.as_deref(), effects),
            Err(_) => debug!("event received without a session"),
        }
    }

    async fn fetch_page(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        before: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let session = self.session().await?;
        let fetched = self
            .api
            .fetch_messages(&session, &conversation_id, before, self.page_size)
            .await;

        match fetched {
            Ok(page) => {
                let ((outcome, effects), channel) = self
                    .reconcile(|reconciler| reconciler.apply_page(&conversation_id, page, before))
                    .await?;
                if outcome == Outcome::Stale {
                    debug!(%conversation_id, "page response arrived after context switch");
                    return Ok(());
                }
                self.perform_effects(channel.as_deref(), effects);
                Ok(())
            }
            Err(err) => {
                let (current, _) = self
                    .reconcile(|reconciler| {
                        let current = reconciler.ensure_current(&conversation_id);
                        if current.is_ok() {
                            reconciler.page_failed(&conversation_id);
                        }
                        current
                    })
                    .await?;
                if let Err(stale) = current {
                    debug!("dropping page failure: {stale}");
                    return Ok(());
                }
                warn!(%conversation_id, "message page fetch failed: {err}");
                Err(err)
            }
        }
    }

    async fn submit_mark_read(self: &Arc<Self>, request: MarkReadRequest) {
        let Ok(session) = self.session().await else {
            return;
        };
        match self.api.mark_read(&session, &request).await {
            Ok(ack) => {
                let Ok(((outcome, effects), channel)) = self
                    .reconcile(|reconciler| reconciler.mark_read_succeeded(ack))
                    .await
                else {
                    return;
                };
                if outcome == Outcome::Stale {
                    debug!(
                        conversation_id = %request.conversation_id,
                        "read receipt acknowledged after context switch"
                    );
                }
                self.perform_effects(channel.as_deref(), effects);
            }
            Err(err) => {
                warn!(
                    conversation_id = %request.conversation_id,
                    message_id = %request.message_id,
                    "mark-read failed: {err}"
                );
                let _ = self
                    .reconcile(|reconciler| reconciler.mark_read_failed(&request.conversation_id))
                    .await;
            }
        }
    }

    async fn deliver(
        self: &Arc<Self>,
        local_id: MessageId,
        request: SendMessageRequest,
    ) -> Result<MessageId> {
        let session = self.session().await?;
        match self.api.send_message(&session, &request).await {
            Ok(confirmed) => {
                let confirmed_id = confirmed.message_id.clone();
                let (effects, channel) = self
                    .reconcile(|reconciler| reconciler.confirm_send(&local_id, confirmed))
                    .await?;
                self.perform_effects(channel.as_deref(), effects);
                Ok(confirmed_id)
            }
            Err(err) => {
                warn!(%local_id, conversation_id = %request.conversation_id, "send failed: {err}");
                if let Ok((effects, channel)) = self
                    .reconcile(|reconciler| reconciler.fail_send(&local_id))
                    .await
                {
                    self.perform_effects(channel.as_deref(), effects);
                }
                self.emit(ClientEvent::SendFailed {
                    local_id,
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                });
                Err(err)
            }
        }
    }

    fn spawn_event_pump(self: &Arc<Self>, channel: &EventChannel) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        for name in [
            EventName::NewMessage,
            EventName::ConversationUpdated,
            EventName::Error,
        ] {
            let tx = tx.clone();
            channel.on(name, move |event| {
                let _ = tx.send(event.clone());
            });
        }

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                client.handle_server_event(event).await;
            }
        })
    }

    async fn teardown(&self) {
        self.channels.disconnect().await;
        if let Some(state) = self.inner.lock().await.take() {
            if let Some(pump) = state.event_pump {
                pump.abort();
            }
            info!(user_id = %state.identity.user_id, "session closed");
        }
    }
}

#[async_trait]
impl ClientHandle for Arc<ChatClient> {
    async fn login(&self, server_url: &str, username: &str) -> Result<UserId> {
        let server_url = server_url.trim_end_matches('/');
        let user_id = self.api.login(server_url, username).await?;
        let identity = SessionIdentity::new(server_url, user_id.clone());

        self.teardown().await;
        let channel = self.channels.connect(&identity).await?;
        let pump = self.spawn_event_pump(&channel);
        {
            let mut guard = self.inner.lock().await;
            *guard = Some(SessionState {
                identity,
                reconciler: Reconciler::new(user_id.clone()),
                channel: Some(channel),
                event_pump: Some(pump),
            });
        }
        info!(%user_id, "logged in");

        self.refresh_conversations().await?;
        Ok(user_id)
    }

    async fn logout(&self) {
        self.teardown().await;
        self.emit(ClientEvent::SummariesChanged);
        self.emit(ClientEvent::MessagesChanged);
    }

    async fn refresh_conversations(&self) -> Result<()> {
        let session = self.session().await?;
        let summaries: Vec<ConversationSummary> = self
            .api
            .list_conversations(&session)
            .await?
            .into_iter()
            .map(ConversationSummary::from)
            .collect();
        let (effects, channel) = self
            .reconcile(|reconciler| reconciler.replace_summaries(summaries))
            .await?;
        self.perform_effects(channel.as_deref(), effects);
        Ok(())
    }

    async fn open_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let (effects, channel) = self
            .reconcile(|reconciler| reconciler.open_conversation_with(conversation_id))
            .await?;

        let mut fetch = None;
        let mut rest = Vec::with_capacity(effects.len());
        for effect in effects {
            match effect {
                Effect::FetchPage {
                    conversation_id,
                    before,
                } => fetch = Some((conversation_id, before)),
                other => rest.push(other),
            }
        }
        self.perform_effects(channel.as_deref(), rest);

        match fetch {
            Some((conversation_id, before)) => self.fetch_page(conversation_id, before).await,
            None => Ok(()),
        }
    }

    async fn close_conversation(&self) -> Result<()> {
        let (effects, channel) = self
            .reconcile(|reconciler| reconciler.close_conversation())
            .await?;
        self.perform_effects(channel.as_deref(), effects);
        Ok(())
    }

    async fn load_older_messages(&self) -> Result<bool> {
        let (effect, _) = self
            .reconcile(|reconciler| reconciler.request_older_page())
            .await?;
        match effect {
            Some(Effect::FetchPage {
                conversation_id,
                before,
            }) => {
                self.fetch_page(conversation_id, before).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn send_message(&self, body: &str, reply_to: Option<MessageId>) -> Result<MessageId> {
        let (begun, _) = self
            .reconcile(|reconciler| reconciler.begin_send(body, reply_to, Utc::now()))
            .await?;
        let (echo, request) = begun?;
        self.emit(ClientEvent::MessagesChanged);
        self.deliver(echo.id, request).await
    }

    async fn retry_send(&self, local_id: &MessageId) -> Result<MessageId> {
        let (request, _) = self
            .reconcile(|reconciler| reconciler.retry_send(local_id))
            .await?;
        let request = request?;
        self.emit(ClientEvent::MessagesChanged);
        self.deliver(local_id.clone(), request).await
    }

    async fn set_viewport_at_bottom(&self, at_bottom: bool) -> Result<()> {
        let (effects, channel) = self
            .reconcile(|reconciler| reconciler.set_viewport_at_bottom(at_bottom))
            .await?;
        self.perform_effects(channel.as_deref(), effects);
        Ok(())
    }

    async fn mark_newest_read(&self) -> Result<()> {
        let (effect, channel) = self
            .reconcile(|reconciler| reconciler.request_mark_read())
            .await?;
        self.perform_effects(channel.as_deref(), effect.into_iter().collect());
        Ok(())
    }

    async fn snapshot(&self) -> Option<Snapshot> {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|state| state.reconciler.snapshot())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
