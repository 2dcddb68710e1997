use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, UserId},
    error::ApiError,
    protocol::{
        ConversationPayload, MarkReadAck, MarkReadRequest, MessagePage, MessagePayload,
        SendMessageRequest,
    },
};

use crate::{
    error::{ClientError, Result},
    transport::SessionIdentity,
};

/// Request/response side of the chat server.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn login(&self, server_url: &str, username: &str) -> Result<UserId>;
    async fn list_conversations(&self, session: &SessionIdentity)
        -> Result<Vec<ConversationPayload>>;
    async fn fetch_messages(
        &self,
        session: &SessionIdentity,
        conversation_id: &ConversationId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<MessagePage>;
    async fn send_message(
        &self,
        session: &SessionIdentity,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload>;
    async fn mark_read(
        &self,
        session: &SessionIdentity,
        request: &MarkReadRequest,
    ) -> Result<MarkReadAck>;
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: UserId,
}

#[derive(Serialize)]
struct ListMessagesQuery<'a> {
    user_id: &'a str,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<DateTime<Utc>>,
}

pub struct HttpChatApi {
    http: Client,
}

impl HttpChatApi {
    /// `request_timeout` bounds the lifetime of every request; a send that
    /// outlives it fails and its echo is offered for retry.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn login(&self, server_url: &str, username: &str) -> Result<UserId> {
        let response = self
            .http
            .post(format!("{server_url}/login"))
            .json(&LoginRequest { username })
            .send()
            .await?;
        let body: LoginResponse = check_status(response).await?.json().await?;
        Ok(body.user_id)
    }

    async fn list_conversations(
        &self,
        session: &SessionIdentity,
    ) -> Result<Vec<ConversationPayload>> {
        let response = self
            .http
            .get(format!("{}/conversations", session.server_url))
            .query(&[("user_id", session.user_id.as_str())])
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn fetch_messages(
        &self,
        session: &SessionIdentity,
        conversation_id: &ConversationId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<MessagePage> {
        let response = self
            .http
            .get(format!(
                "{}/conversations/{conversation_id}/messages",
                session.server_url
            ))
            .query(&ListMessagesQuery {
                user_id: session.user_id.as_str(),
                limit: limit.clamp(1, 100),
                before,
            })
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn send_message(
        &self,
        session: &SessionIdentity,
        request: &SendMessageRequest,
    ) -> Result<MessagePayload> {
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/messages",
                session.server_url, request.conversation_id
            ))
            .query(&[("user_id", session.user_id.as_str())])
            .json(request)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn mark_read(
        &self,
        session: &SessionIdentity,
        request: &MarkReadRequest,
    ) -> Result<MarkReadAck> {
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/read",
                session.server_url, request.conversation_id
            ))
            .query(&[("user_id", session.user_id.as_str())])
            .json(request)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }
}

// Non-2xx responses become `Network` errors carrying the server's message.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|err| err.to_string())
        .unwrap_or(body);
    Err(ClientError::Network {
        status: Some(status.as_u16()),
        message,
    })
}
