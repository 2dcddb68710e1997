use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    config::load_settings, ChatClient, ClientEvent, ClientHandle, DeliveryState, Message,
};
use shared::domain::{ConversationId, MessageId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the server url from chat_client.toml and the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    username: String,
    /// Conversation to open after login.
    #[arg(long)]
    conversation: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    let client = ChatClient::new(&settings)?;
    let user_id = client.login(&settings.server_url, &args.username).await?;
    println!("Logged in as {user_id}");
    print_conversations(&client).await;

    let printer = tokio::spawn(print_events(Arc::clone(&client)));
    if let Some(conversation) = args.conversation {
        client
            .open_conversation(ConversationId::from(conversation.as_str()))
            .await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let outcome = match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => continue,
            ("/quit", _) => break,
            ("/list", _) => {
                print_conversations(&client).await;
                Ok(())
            }
            ("/open", id) => client.open_conversation(ConversationId::from(id)).await,
            ("/close", _) => client.close_conversation().await,
            ("/older", _) => client.load_older_messages().await.map(|loaded| {
                if !loaded {
                    println!("(no older messages)");
                }
            }),
            ("/retry", id) => client.retry_send(&MessageId::from(id)).await.map(|_| ()),
            _ => client.send_message(line, None).await.map(|_| ()),
        };
        if let Err(err) = outcome {
            warn!("{err}");
        }
    }

    printer.abort();
    client.logout().await;
    Ok(())
}

async fn print_conversations(client: &Arc<ChatClient>) {
    let Some(snapshot) = client.snapshot().await else {
        return;
    };
    for summary in &snapshot.summaries {
        let marker = if summary.unread { "*" } else { " " };
        let title = summary.name.as_deref().unwrap_or(summary.id.as_str());
        let preview = summary
            .last_message
            .as_ref()
            .map(|last| last.body.as_str())
            .unwrap_or("");
        println!("{marker} {title} ({}) {preview}", summary.participant_count);
    }
}

async fn print_events(client: Arc<ChatClient>) {
    let mut events = client.subscribe_events();
    let mut printed: HashSet<MessageId> = HashSet::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer fell behind");
                ClientEvent::MessagesChanged
            }
            Err(RecvError::Closed) => return,
        };
        match event {
            ClientEvent::MessagesChanged => {
                let Some(snapshot) = client.snapshot().await else {
                    continue;
                };
                for message in unprinted(&snapshot.messages, &mut printed) {
                    print_message(message);
                }
            }
            ClientEvent::SummariesChanged => {}
            ClientEvent::ReadCursorsChanged { .. } | ClientEvent::ScrollToBottom => {}
            ClientEvent::SendFailed {
                local_id, message, ..
            } => println!("! send failed ({message}); /retry {local_id}"),
            ClientEvent::Error(message) => println!("! {message}"),
        }
    }
}

/// Confirmed messages not shown yet, oldest first, so older pages show up
/// as well as new arrivals.
fn unprinted<'a>(messages: &'a [Message], printed: &mut HashSet<MessageId>) -> Vec<&'a Message> {
    messages
        .iter()
        .rev()
        .filter(|message| message.delivery == DeliveryState::Confirmed)
        .filter(|message| printed.insert(message.id.clone()))
        .collect()
}

fn print_message(message: &Message) {
    let sender = message
        .sender_username
        .as_deref()
        .unwrap_or(message.sender_id.as_str());
    println!("[{}] {sender}: {}", message.created_at.format("%H:%M"), message.body);
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
