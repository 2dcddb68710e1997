use super::*;
use std::sync::atomic::AtomicUsize;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{TimeZone, Utc};
use shared::{
    domain::{ConversationId, MessageId},
    protocol::MessagePayload,
};
use tokio::{net::TcpListener, sync::broadcast, time::timeout};

fn sample_event() -> ServerEvent {
    ServerEvent::NewMessage {
        message: MessagePayload {
            message_id: MessageId::from("m1"),
            conversation_id: ConversationId::from("c1"),
            sender_id: UserId::from("bob"),
            sender_username: Some("bob".into()),
            body: "hello".into(),
            reply_to: None,
            created_at: Utc.timestamp_opt(10, 0).unwrap(),
        },
    }
}

fn detached_channel() -> (EventChannel, mpsc::UnboundedReceiver<ClientRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventChannel::new(tx), rx)
}

#[test]
fn ws_url_maps_scheme_and_carries_identity() {
    let identity = SessionIdentity::new("https://chat.example.com/api/", UserId::from("alice"));
    assert_eq!(
        identity.ws_url().expect("url").as_str(),
        "wss://chat.example.com/api/ws?user_id=alice"
    );

    let identity = SessionIdentity::new("http://127.0.0.1:8443", UserId::from("bob"));
    assert_eq!(
        identity.ws_url().expect("url").as_str(),
        "ws://127.0.0.1:8443/ws?user_id=bob"
    );
}

#[test]
fn ws_url_rejects_unsupported_scheme() {
    let identity = SessionIdentity::new("ftp://chat.example.com", UserId::from("alice"));
    assert!(matches!(
        identity.ws_url(),
        Err(ClientError::InvalidServerUrl(_))
    ));
    let identity = SessionIdentity::new("not a url", UserId::from("alice"));
    assert!(identity.ws_url().is_err());
}

#[test]
fn handlers_receive_only_their_event_name() {
    let (channel, _rx) = detached_channel();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    channel.on(EventName::NewMessage, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    channel.on(EventName::ConversationUpdated, |_| {
        panic!("wrong handler invoked");
    });

    assert_eq!(channel.dispatch(&sample_event()), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn off_removes_only_the_given_handler() {
    let (channel, _rx) = detached_channel();
    let first = channel.on(EventName::NewMessage, |_| {});
    channel.on(EventName::NewMessage, |_| {});
    assert_eq!(channel.handler_count(), 2);

    assert!(channel.off(EventName::NewMessage, first));
    assert!(!channel.off(EventName::NewMessage, first));
    assert!(!channel.off(EventName::Error, first));
    assert_eq!(channel.dispatch(&sample_event()), 1);
}

#[test]
fn emit_queues_control_requests_until_channel_closes() {
    let (channel, mut rx) = detached_channel();
    let join = ClientRequest::JoinConversation {
        conversation_id: ConversationId::from("c1"),
    };

    channel.emit(join.clone()).expect("emit");
    assert_eq!(rx.try_recv().expect("queued"), join);

    drop(rx);
    assert!(matches!(
        channel.emit(join),
        Err(ClientError::ChannelClosed)
    ));
}

#[derive(Clone)]
struct WsState {
    events: broadcast::Sender<String>,
    received: mpsc::UnboundedSender<String>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: WsState) {
    let mut events = state.events.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(text) = event else { return };
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    return;
                }
            }
            frame = socket.recv() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = state.received.send(text);
                }
                Some(Ok(_)) => {}
                _ => return,
            }
        }
    }
}

async fn spawn_ws_server() -> (
    String,
    broadcast::Sender<String>,
    mpsc::UnboundedReceiver<String>,
) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (events, _) = broadcast::channel(16);
    let (received_tx, received_rx) = mpsc::unbounded_channel();
    let state = WsState {
        events: events.clone(),
        received: received_tx,
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), events, received_rx)
}

#[tokio::test]
async fn adapter_delivers_events_and_forwards_control_requests() {
    let (server_url, events, mut received) = spawn_ws_server().await;
    let adapter = EventChannelAdapter::new(Duration::from_millis(50));
    let identity = SessionIdentity::new(server_url, UserId::from("alice"));

    let channel = adapter.connect(&identity).await.expect("connect");
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    channel.on(EventName::NewMessage, move |event| {
        let _ = event_tx.send(event.clone());
    });

    channel
        .emit(ClientRequest::JoinConversation {
            conversation_id: ConversationId::from("c1"),
        })
        .expect("emit");
    let control = timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("control frame in time")
        .expect("control frame");
    assert_eq!(
        control,
        r#"{"type":"join_conversation","payload":{"conversation_id":"c1"}}"#
    );

    // The socket is registered by now, so the broadcast reaches it.
    events
        .send(serde_json::to_string(&sample_event()).expect("encode"))
        .expect("broadcast");
    let delivered = timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(delivered, sample_event());
}

#[tokio::test]
async fn connect_reuses_open_channel_and_disconnect_clears_handlers() {
    let (server_url, _events, _received) = spawn_ws_server().await;
    let adapter = EventChannelAdapter::new(Duration::from_millis(50));
    let identity = SessionIdentity::new(server_url, UserId::from("alice"));

    let first = adapter.connect(&identity).await.expect("connect");
    first.on(EventName::NewMessage, |_| {});
    let second = adapter.connect(&identity).await.expect("connect again");
    assert!(Arc::ptr_eq(&first, &second));

    assert!(adapter.disconnect().await);
    assert_eq!(first.handler_count(), 0);
    assert!(adapter.channel().await.is_none());
    assert!(!adapter.disconnect().await);
}

#[tokio::test]
async fn connect_failure_surfaces_network_error() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let adapter = EventChannelAdapter::new(Duration::from_millis(50));
    let identity = SessionIdentity::new(format!("http://{addr}"), UserId::from("alice"));
    let err = adapter.connect(&identity).await.err().expect("connect fails");
    assert!(matches!(err, ClientError::Network { status: None, .. }));
    assert!(adapter.channel().await.is_none());
}
