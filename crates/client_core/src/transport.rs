//! Event channel adapter: one long-lived WebSocket per authenticated session.
//!
//! The adapter reconnects on its own after a transport failure but never
//! replays events missed while disconnected; callers resynchronize with a
//! full reload when they switch context.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ClientError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Who the channel is opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub server_url: String,
    pub user_id: UserId,
}

impl SessionIdentity {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            server_url: server_url.into(),
            user_id,
        }
    }

    pub fn ws_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|_| ClientError::InvalidServerUrl(self.server_url.clone()))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            _ => return Err(ClientError::InvalidServerUrl(self.server_url.clone())),
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidServerUrl(self.server_url.clone()))?;
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("user_id", self.user_id.as_str());
        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    NewMessage,
    ConversationUpdated,
    Error,
}

impl EventName {
    pub fn of(event: &ServerEvent) -> Self {
        match event {
            ServerEvent::NewMessage { .. } => Self::NewMessage,
            ServerEvent::ConversationUpdated { .. } => Self::ConversationUpdated,
            ServerEvent::Error(_) => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Subscription surface of an open connection.
pub struct EventChannel {
    handlers: RwLock<HashMap<EventName, Vec<(HandlerId, EventHandler)>>>,
    next_handler_id: AtomicU64,
    outbound: mpsc::UnboundedSender<ClientRequest>,
}

impl EventChannel {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<ClientRequest>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            outbound,
        }
    }

    pub fn on<F>(&self, name: EventName, handler: F) -> HandlerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, name: EventName, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(registered) = handlers.get_mut(&name) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(handler_id, _)| *handler_id != id);
        before != registered.len()
    }

    pub fn emit(&self, request: ClientRequest) -> Result<()> {
        self.outbound
            .send(request)
            .map_err(|_| ClientError::ChannelClosed)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Invokes every handler registered for the event's name. Handlers are
    /// cloned out first so one may call `on`/`off` without deadlocking.
    pub(crate) fn dispatch(&self, event: &ServerEvent) -> usize {
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&EventName::of(event))
            .map(|registered| {
                registered
                    .iter()
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect()
            })
            .unwrap_or_default();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub(crate) fn clear_handlers(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

struct ActiveChannel {
    identity: SessionIdentity,
    channel: Arc<EventChannel>,
    task: JoinHandle<()>,
}

pub struct EventChannelAdapter {
    reconnect_delay: Duration,
    active: Mutex<Option<ActiveChannel>>,
}

impl EventChannelAdapter {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            reconnect_delay,
            active: Mutex::new(None),
        }
    }

    /// Opens the session's channel. While one is open this is a no-op that
    /// returns the existing channel.
    pub async fn connect(&self, identity: &SessionIdentity) -> Result<Arc<EventChannel>> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            if existing.identity != *identity {
                warn!(
                    open_for = %existing.identity.user_id,
                    requested_for = %identity.user_id,
                    "event channel already open for another identity"
                );
            }
            return Ok(Arc::clone(&existing.channel));
        }

        let ws_url = identity.ws_url()?;
        let (stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|err| ClientError::network(format!("failed to connect websocket {ws_url}: {err}")))?;
        info!(user_id = %identity.user_id, "event channel connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(EventChannel::new(outbound_tx));
        let task = tokio::spawn(drive_connection(
            stream,
            ws_url,
            Arc::clone(&channel),
            outbound_rx,
            self.reconnect_delay,
        ));
        *active = Some(ActiveChannel {
            identity: identity.clone(),
            channel: Arc::clone(&channel),
            task,
        });
        Ok(channel)
    }

    /// Tears the connection down and deregisters every handler.
    pub async fn disconnect(&self) -> bool {
        let Some(active) = self.active.lock().await.take() else {
            return false;
        };
        active.task.abort();
        active.channel.clear_handlers();
        info!(user_id = %active.identity.user_id, "event channel closed");
        true
    }

    pub async fn channel(&self) -> Option<Arc<EventChannel>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.channel))
    }
}

async fn drive_connection(
    stream: WsStream,
    ws_url: Url,
    channel: Arc<EventChannel>,
    mut outbound: mpsc::UnboundedReceiver<ClientRequest>,
    reconnect_delay: Duration,
) {
    let mut stream = stream;
    loop {
        let (mut writer, mut reader) = stream.split();
        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            let delivered = channel.dispatch(&event);
                            debug!(event = ?EventName::of(&event), delivered, "event dispatched");
                        }
                        Err(err) => warn!("invalid server event: {err}"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("websocket receive failed: {err}");
                        break;
                    }
                },
                request = outbound.recv() => {
                    let Some(request) = request else {
                        return;
                    };
                    let text = match serde_json::to_string(&request) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("failed to encode control request: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = writer.send(Message::Text(text)).await {
                        warn!("websocket send failed: {err}");
                        break;
                    }
                }
            }
        }

        stream = loop {
            tokio::time::sleep(reconnect_delay).await;
            match connect_async(ws_url.as_str()).await {
                Ok((stream, _)) => {
                    info!("event channel reconnected");
                    break stream;
                }
                Err(err) => warn!("event channel reconnect failed: {err}"),
            }
        };
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
