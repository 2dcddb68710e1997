use shared::domain::ConversationId;
use thiserror::Error;

/// Failures surfaced by the client. Business-level conditions (duplicates,
/// out-of-order updates) are never errors; see [`crate::types::Outcome`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed (status {status:?}): {message}")]
    Network {
        status: Option<u16>,
        message: String,
    },
    #[error("response for conversation {conversation_id} arrived after a context switch")]
    StaleResponse { conversation_id: ConversationId },
    #[error("not logged in")]
    NotLoggedIn,
    #[error("no conversation is open")]
    NoOpenConversation,
    #[error("no local echo with id {0}")]
    UnknownLocalEcho(String),
    #[error("event channel is closed")]
    ChannelClosed,
    #[error("server_url must start with http:// or https://: {0}")]
    InvalidServerUrl(String),
}

impl ClientError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the caller may offer the user a retry for this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { status, .. } => match status {
                None => true,
                Some(code) => *code == 408 || *code == 429 || *code >= 500,
            },
            Self::ChannelClosed => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            status: err.status().map(|status| status.as_u16()),
            message: err.to_string(),
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
