use super::*;
use std::{collections::HashMap, future::Future, time::Duration};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::TimeZone;
use serde_json::{json, Value};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{ConversationPayload, MarkReadAck, MessagePage, MessagePayload},
};
use tokio::{net::TcpListener, time::timeout};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn remote(id: &str, conversation: &str, sender: &str, created_at: DateTime<Utc>) -> MessagePayload {
    MessagePayload {
        message_id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation),
        sender_id: UserId::from(sender),
        sender_username: Some(sender.to_string()),
        body: format!("body {id}"),
        reply_to: None,
        created_at,
    }
}

fn conversation(id: &str) -> ConversationPayload {
    ConversationPayload {
        conversation_id: ConversationId::from(id),
        participants: vec![UserId::from("alice"), UserId::from("bob")],
        is_group: false,
        name: None,
        group_picture: None,
        last_message: None,
        unread: false,
        read_cursors: HashMap::new(),
        updated_at: ts(1),
    }
}

#[derive(Default)]
struct MockChat {
    messages: HashMap<String, Vec<MessagePayload>>,
    slow_conversation: Option<String>,
    fail_sends: bool,
    sent: Vec<SendMessageRequest>,
    reads: Vec<MarkReadRequest>,
    control: Vec<String>,
    next_id: u64,
}

impl MockChat {
    fn created_at_of(&self, message_id: &MessageId) -> Option<DateTime<Utc>> {
        self.messages
            .values()
            .flatten()
            .find(|m| m.message_id == *message_id)
            .map(|m| m.created_at)
    }

    fn reads_of(&self, message_id: &str) -> usize {
        self.reads
            .iter()
            .filter(|r| r.message_id.as_str() == message_id)
            .count()
    }
}

#[derive(Clone)]
struct ServerState {
    chat: Arc<Mutex<MockChat>>,
    events: broadcast::Sender<String>,
}

impl ServerState {
    async fn publish(&self, message: MessagePayload) {
        self.chat
            .lock()
            .await
            .messages
            .entry(message.conversation_id.to_string())
            .or_default()
            .push(message.clone());
        let event = ServerEvent::NewMessage { message };
        let _ = self
            .events
            .send(serde_json::to_string(&event).expect("encode event"));
    }
}

async fn handle_login(Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "user_id": body["username"] }))
}

async fn handle_conversations() -> Json<Vec<ConversationPayload>> {
    Json(vec![conversation("c1"), conversation("c2")])
}

async fn handle_messages(
    State(state): State<ServerState>,
    Path(conversation_id): Path<String>,
) -> Json<MessagePage> {
    let (messages, slow) = {
        let chat = state.chat.lock().await;
        (
            chat.messages.get(&conversation_id).cloned().unwrap_or_default(),
            chat.slow_conversation.as_deref() == Some(conversation_id.as_str()),
        )
    };
    if slow {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    Json(MessagePage {
        messages,
        next_cursor: None,
        has_more: false,
    })
}

async fn handle_send(
    State(state): State<ServerState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, (StatusCode, Json<ApiError>)> {
    let mut chat = state.chat.lock().await;
    chat.sent.push(request.clone());
    if chat.fail_sends {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, "try again later")),
        ));
    }
    chat.next_id += 1;
    let sender = query.get("user_id").cloned().unwrap_or_default();
    let mut stored = remote(
        &format!("srv-{}", chat.next_id),
        &conversation_id,
        &sender,
        Utc::now(),
    );
    stored.body = request.body;
    stored.reply_to = request.reply_to;
    chat.messages
        .entry(conversation_id)
        .or_default()
        .push(stored.clone());
    Ok(Json(stored))
}

async fn handle_read(
    State(state): State<ServerState>,
    Json(request): Json<MarkReadRequest>,
) -> Json<MarkReadAck> {
    let mut chat = state.chat.lock().await;
    let message_created_at = chat
        .created_at_of(&request.message_id)
        .unwrap_or_else(Utc::now);
    chat.reads.push(request.clone());
    Json(MarkReadAck {
        conversation_id: request.conversation_id,
        message_id: request.message_id,
        message_created_at,
    })
}

async fn handle_ws(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: ServerState) {
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
                Some(Ok(WsMessage::Text(text))) => state.chat.lock().await.control.push(text),
                Some(Ok(_)) => {}
                _ => return,
            }
        }
    }
}

async fn spawn_chat_server() -> Result<(String, ServerState), std::io::Error> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (events, _) = broadcast::channel(64);
    let state = ServerState {
        chat: Arc::new(Mutex::new(MockChat::default())),
        events,
    };
    state
        .chat
        .lock()
        .await
        .messages
        .insert("c1".into(), vec![remote("m1", "c1", "bob", ts(10))]);

    let app = Router::new()
        .route("/login", post(handle_login))
        .route("/conversations", get(handle_conversations))
        .route(
            "/conversations/:conversation_id/messages",
            get(handle_messages).post(handle_send),
        )
        .route("/conversations/:conversation_id/read", post(handle_read))
        .route("/ws", get(handle_ws))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

async fn logged_in_client(server_url: &str) -> Arc<ChatClient> {
    let settings = ClientSettings {
        server_url: server_url.to_string(),
        reconnect_delay: Duration::from_millis(50),
        ..ClientSettings::default()
    };
    let client = ChatClient::new(&settings).expect("client");
    let user_id = client.login(server_url, "alice").await.expect("login");
    assert_eq!(user_id, UserId::from("alice"));
    client
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let reached = timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn wait_for_join(state: &ServerState, conversation_id: &str) {
    let expected = format!(
        r#"{{"type":"join_conversation","payload":{{"conversation_id":"{conversation_id}"}}}}"#
    );
    eventually("join control frame", || {
        let state = state.clone();
        let expected = expected.clone();
        async move { state.chat.lock().await.control.contains(&expected) }
    })
    .await;
}

async fn wait_for_own_cursor(client: &Arc<ChatClient>, message_id: &str) {
    eventually("own read cursor", || {
        let client = Arc::clone(client);
        let message_id = MessageId::from(message_id);
        async move {
            client
                .snapshot()
                .await
                .and_then(|s| s.read_cursors.get(&UserId::from("alice")).cloned())
                .is_some_and(|cursor| cursor.message_id == message_id)
        }
    })
    .await;
}

#[tokio::test]
async fn login_loads_conversation_list() {
    let (server_url, _state) = spawn_chat_server().await.expect("spawn server");
    let client = logged_in_client(&server_url).await;

    let snapshot = client.snapshot().await.expect("snapshot");
    let ids: Vec<&str> = snapshot.summaries.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2"]);
    assert!(snapshot.open_conversation.is_none());
}

#[tokio::test]
async fn open_and_send_replaces_echo_with_confirmed_record() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    let client = logged_in_client(&server_url).await;

    client
        .open_conversation(ConversationId::from("c1"))
        .await
        .expect("open");
    wait_for_join(&state, "c1").await;
    let snapshot = client.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id, MessageId::from("m1"));

    let confirmed = client.send_message("hi", None).await.expect("send");
    assert!(!confirmed.is_local_echo());

    let snapshot = client.snapshot().await.expect("snapshot");
    let ids: Vec<&MessageId> = snapshot.messages.iter().map(|m| &m.id).collect();
    assert_eq!(ids, vec![&confirmed, &MessageId::from("m1")]);
    assert!(snapshot.messages.iter().all(Message::is_confirmed));
    let summary = &snapshot.summaries[0];
    assert_eq!(summary.id, ConversationId::from("c1"));
    assert_eq!(
        summary.last_message.as_ref().map(|l| l.body.as_str()),
        Some("hi")
    );

    let sent = state.chat.lock().await.sent.clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body, "hi");
}

#[tokio::test]
async fn incoming_message_is_marked_read_exactly_once() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    let client = logged_in_client(&server_url).await;
    let mut events = client.subscribe_events();

    client
        .open_conversation(ConversationId::from("c1"))
        .await
        .expect("open");
    wait_for_join(&state, "c1").await;
    wait_for_own_cursor(&client, "m1").await;

    let def = remote("def", "c1", "bob", Utc::now());
    state.publish(def.clone()).await;
    state.publish(def).await;

    wait_for_own_cursor(&client, "def").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    {
        let chat = state.chat.lock().await;
        assert_eq!(chat.reads_of("m1"), 1);
        assert_eq!(chat.reads_of("def"), 1);
    }
    let snapshot = client.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.messages[0].id, MessageId::from("def"));

    let mut scrolled = false;
    while let Ok(event) = events.try_recv() {
        scrolled |= event == ClientEvent::ScrollToBottom;
    }
    assert!(scrolled);
}

#[tokio::test]
async fn message_for_background_conversation_marks_it_unread() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    let client = logged_in_client(&server_url).await;
    client
        .open_conversation(ConversationId::from("c1"))
        .await
        .expect("open");
    wait_for_join(&state, "c1").await;

    state
        .publish(remote("x1", "c2", "bob", Utc::now()))
        .await;

    eventually("c2 unread", || {
        let client = Arc::clone(&client);
        async move {
            client.snapshot().await.is_some_and(|s| {
                s.summaries
                    .iter()
                    .any(|summary| summary.id.as_str() == "c2" && summary.unread)
            })
        }
    })
    .await;

    let snapshot = client.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.summaries[0].id, ConversationId::from("c2"));
    assert!(snapshot.messages.iter().all(|m| m.id.as_str() != "x1"));
    assert_eq!(state.chat.lock().await.reads_of("x1"), 0);
}

#[tokio::test]
async fn failed_send_keeps_echo_for_retry() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    let client = logged_in_client(&server_url).await;
    client
        .open_conversation(ConversationId::from("c1"))
        .await
        .expect("open");
    let mut events = client.subscribe_events();
    state.chat.lock().await.fail_sends = true;

    let err = client.send_message("hi", None).await.expect_err("send fails");
    assert!(matches!(
        err,
        ClientError::Network {
            status: Some(503),
            ..
        }
    ));

    let local_id = loop {
        match events.recv().await.expect("client event") {
            ClientEvent::SendFailed {
                local_id,
                retryable,
                ..
            } => {
                assert!(retryable);
                break local_id;
            }
            _ => continue,
        }
    };
    let snapshot = client.snapshot().await.expect("snapshot");
    let failed = snapshot
        .messages
        .iter()
        .find(|m| m.id == local_id)
        .expect("failed echo");
    assert_eq!(failed.delivery, DeliveryState::Failed);

    state.chat.lock().await.fail_sends = false;
    let confirmed = client.retry_send(&local_id).await.expect("retry");

    let snapshot = client.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.messages[0].id, confirmed);
    assert!(snapshot.messages.iter().all(|m| m.id != local_id));
    assert_eq!(state.chat.lock().await.sent.len(), 2);
}

#[tokio::test]
async fn page_for_abandoned_conversation_is_discarded() {
    let (server_url, state) = spawn_chat_server().await.expect("spawn server");
    state.chat.lock().await.slow_conversation = Some("c1".into());
    state
        .chat
        .lock()
        .await
        .messages
        .insert("c2".into(), vec![remote("n1", "c2", "bob", ts(20))]);
    let client = logged_in_client(&server_url).await;

    let slow_open = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.open_conversation(ConversationId::from("c1")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client
        .open_conversation(ConversationId::from("c2"))
        .await
        .expect("open c2");

    slow_open
        .await
        .expect("join")
        .expect("stale page is not an error");

    let snapshot = client.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.open_conversation, Some(ConversationId::from("c2")));
    let ids: Vec<&str> = snapshot.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["n1"]);
}

#[tokio::test]
async fn logout_drops_session_state() {
    let (server_url, _state) = spawn_chat_server().await.expect("spawn server");
    let client = logged_in_client(&server_url).await;

    client.logout().await;

    assert!(client.snapshot().await.is_none());
    assert!(matches!(
        client.open_conversation(ConversationId::from("c1")).await,
        Err(ClientError::NotLoggedIn)
    ));
    assert!(matches!(
        client.send_message("hi", None).await,
        Err(ClientError::NotLoggedIn)
    ));
}
