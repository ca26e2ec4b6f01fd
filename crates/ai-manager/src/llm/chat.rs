use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tracing::{debug, error, info};

use super::formatter::{FormatError, PromptData};
use super::gateway::{ChatCompletionRequest, ChatGateway, ChatMessage, GatewayError};
use crate::prompts::{Prompt, PromptTable};

pub type InvokeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<String>, ChatError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("prompt '{0}' not found")]
    PromptNotFound(String),
    #[error("prompt '{0}' produced no messages")]
    EmptyPrompt(String),
    #[error("missing required data keys for prompt '{prompt_name}': {missing:?}")]
    MissingDataKeys {
        prompt_name: String,
        missing: Vec<String>,
    },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// One model call for a named prompt.
///
/// `Ok(None)` signals that the model produced no usable text. `Err` is a fault
/// (unknown prompt, unformattable template, transport or provider failure).
pub trait ModelInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        prompt_name: &'a str,
        data: &'a PromptData,
        model: &'a str,
        prompts: &'a PromptTable,
    ) -> InvokeFuture<'a>;
}

/// [`ModelInvoker`] that formats the prompt and sends it through a [`ChatGateway`].
#[derive(Debug, Clone)]
pub struct GatewayInvoker<G> {
    gateway: G,
}

impl<G> GatewayInvoker<G> {
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }
}

impl<G> ModelInvoker for GatewayInvoker<G>
where
    G: ChatGateway,
{
    fn invoke<'a>(
        &'a self,
        prompt_name: &'a str,
        data: &'a PromptData,
        model: &'a str,
        prompts: &'a PromptTable,
    ) -> InvokeFuture<'a> {
        Box::pin(async move {
            let prompt = prompts
                .get(prompt_name)
                .ok_or_else(|| ChatError::PromptNotFound(prompt_name.to_string()))?;
            let messages = build_messages(prompt_name, prompt, data)?;

            debug!(prompt_name, model, messages = messages.len(), "sending chat request");
            let completion = self
                .gateway
                .complete(ChatCompletionRequest {
                    model: model.to_string(),
                    messages,
                })
                .await?;

            Ok(completion
                .content
                .map(|content| content.trim().to_string())
                .filter(|content| !content.is_empty()))
        })
    }
}

/// System half first (verbatim), then the formatted user half.
pub fn build_messages(
    prompt_name: &str,
    prompt: &Prompt,
    data: &PromptData,
) -> Result<Vec<ChatMessage>, ChatError> {
    let rendered = prompt.render(data).map_err(|err| match err {
        FormatError::MissingDataKeys { missing } => ChatError::MissingDataKeys {
            prompt_name: prompt_name.to_string(),
            missing,
        },
    })?;

    let messages = rendered
        .system
        .map(ChatMessage::system)
        .into_iter()
        .chain(rendered.user.map(ChatMessage::user))
        .collect::<Vec<_>>();

    if messages.is_empty() {
        return Err(ChatError::EmptyPrompt(prompt_name.to_string()));
    }
    Ok(messages)
}

/// Single unvalidated call. Every failure is logged and collapses to `None`.
pub async fn chat(
    invoker: &dyn ModelInvoker,
    prompts: &PromptTable,
    prompt_name: &str,
    data: &PromptData,
    model: &str,
) -> Option<String> {
    match invoker.invoke(prompt_name, data, model, prompts).await {
        Ok(Some(content)) => {
            info!(prompt_name, "content generation successful");
            Some(content)
        }
        Ok(None) => {
            error!(prompt_name, "model returned an empty response");
            None
        }
        Err(err) => {
            error!(prompt_name, "chat request failed: {err}");
            None
        }
    }
}
