use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ChatGatewayFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ChatCompletion, GatewayError>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub model: String,
    pub provider_request_id: Option<String>,
    /// `None` when the provider answered without message content.
    pub content: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0} is not configured")]
    MissingApiKey(&'static str),
    #[error("failed to build http client: {0}")]
    HttpClient(String),
    #[error("provider request timed out")]
    Timeout,
    #[error("provider request failed: {0}")]
    ProviderFailure(String),
    #[error("provider returned an invalid payload: {0}")]
    InvalidProviderPayload(String),
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Chat-completion seam between the validation loop and vendor HTTP clients.
pub trait ChatGateway: Send + Sync {
    fn complete<'a>(&'a self, request: ChatCompletionRequest) -> ChatGatewayFuture<'a>;
}
