use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::gateway::{
    ChatCompletion, ChatCompletionRequest, ChatGateway, ChatGatewayFuture, ChatMessage,
    GatewayError, TokenUsage,
};
use crate::config::OpenAiConfig;

const ORGANIZATION_HEADER: &str = "OpenAI-Organization";
const SPEECH_RESPONSE_FORMAT: &str = "wav";
const DEFAULT_AUDIO_FILE_NAME: &str = "audio.wav";

#[derive(Debug, Clone, Serialize)]
pub struct SpeechRequest {
    pub model: String,
    pub voice: String,
    pub input: String,
}

/// Audio handed to the transcription endpoint.
#[derive(Debug, Clone)]
pub enum AudioSource {
    Path(PathBuf),
    Bytes { data: Vec<u8>, file_name: String },
}

impl AudioSource {
    async fn into_parts(self) -> Result<(Vec<u8>, String), GatewayError> {
        match self {
            Self::Path(path) => {
                let data = tokio::fs::read(&path).await.map_err(|source| GatewayError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                let file_name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or(DEFAULT_AUDIO_FILE_NAME)
                    .to_string();
                Ok((data, file_name))
            }
            Self::Bytes { data, file_name } => Ok((data, file_name)),
        }
    }
}

/// HTTP client for the OpenAI chat, speech and transcription endpoints.
#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, GatewayError> {
        if config.api_key.trim().is_empty() {
            return Err(GatewayError::MissingApiKey("OPENAI_API_KEY"));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| GatewayError::HttpClient(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    /// Returns the raw audio bytes for `request`.
    pub async fn synthesize_speech(&self, request: &SpeechRequest) -> Result<Vec<u8>, GatewayError> {
        let body = serde_json::json!({
            "model": request.model,
            "voice": request.voice,
            "input": request.input,
            "response_format": SPEECH_RESPONSE_FORMAT,
        });
        let url = self.endpoint("audio/speech");

        let reply = self
            .execute("audio/speech", || self.client.post(&url).json(&body))
            .await?;
        Ok(reply.body)
    }

    /// Synthesizes speech and writes it to `output_path`, creating parent folders.
    pub async fn generate_speech(
        &self,
        request: &SpeechRequest,
        output_path: &Path,
    ) -> Result<PathBuf, GatewayError> {
        let audio = self.synthesize_speech(request).await?;
        write_file(output_path, &audio).await?;
        info!(path = %output_path.display(), bytes = audio.len(), "speech written");
        Ok(output_path.to_path_buf())
    }

    pub async fn transcribe(&self, audio: AudioSource, model: &str) -> Result<String, GatewayError> {
        let (data, file_name) = audio.into_parts().await?;
        let url = self.endpoint("audio/transcriptions");

        let reply = self
            .execute("audio/transcriptions", || {
                let form = Form::new()
                    .text("model", model.to_string())
                    .part("file", Part::bytes(data.clone()).file_name(file_name.clone()));
                self.client.post(&url).multipart(form)
            })
            .await?;

        let parsed: TranscriptionResponse = serde_json::from_slice(&reply.body).map_err(|_| {
            GatewayError::InvalidProviderPayload("transcription_json_parse_failed".to_string())
        })?;
        Ok(parsed.text)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.bearer_auth(&self.config.api_key);
        match self.config.organization_id.as_deref() {
            Some(organization) => builder.header(ORGANIZATION_HEADER, organization),
            None => builder,
        }
    }

    async fn execute<F>(&self, endpoint: &str, build: F) -> Result<ProviderReply, GatewayError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_u32;

        loop {
            match self.send_once(build()).await {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    if err.retryable && attempt < self.config.max_retries {
                        let backoff_multiplier = 2_u64.saturating_pow(attempt);
                        let backoff_ms = self
                            .config
                            .retry_base_backoff_ms
                            .saturating_mul(backoff_multiplier);
                        warn!(endpoint, attempt, backoff_ms, "retrying provider request: {}", err.error);
                        sleep(Duration::from_millis(backoff_ms)).await;
                        attempt = attempt.saturating_add(1);
                        continue;
                    }

                    return Err(err.error);
                }
            }
        }
    }

    async fn send_once(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<ProviderReply, SendAttemptError> {
        let response = self.authorize(builder).send().await.map_err(|err| {
            if err.is_timeout() {
                SendAttemptError::retryable(GatewayError::Timeout)
            } else {
                SendAttemptError::retryable(GatewayError::ProviderFailure(
                    "request_unavailable".to_string(),
                ))
            }
        })?;

        let status = response.status();
        let request_id = header_request_id(response.headers());
        let body = response.bytes().await.map_err(|_| {
            SendAttemptError::non_retryable(GatewayError::InvalidProviderPayload(
                "response_body_read_failed".to_string(),
            ))
        })?;

        if !status.is_success() {
            let provider_code = parse_provider_error_code(&body);
            return Err(SendAttemptError {
                error: GatewayError::ProviderFailure(format!(
                    "status={} code={provider_code}",
                    status.as_u16()
                )),
                retryable: is_retryable_status(status),
            });
        }

        Ok(ProviderReply {
            request_id,
            body: body.to_vec(),
        })
    }
}

impl ChatGateway for OpenAiClient {
    fn complete<'a>(&'a self, request: ChatCompletionRequest) -> ChatGatewayFuture<'a> {
        Box::pin(async move {
            let body = ChatRequestBody {
                model: &request.model,
                messages: &request.messages,
            };
            let url = self.endpoint("chat/completions");
            debug!(model = %request.model, "requesting chat completion");

            let reply = self
                .execute("chat/completions", || self.client.post(&url).json(&body))
                .await?;

            let parsed: ChatSuccessResponse = serde_json::from_slice(&reply.body).map_err(|_| {
                GatewayError::InvalidProviderPayload("response_json_parse_failed".to_string())
            })?;
            let choice = parsed.choices.into_iter().next().ok_or_else(|| {
                GatewayError::InvalidProviderPayload("missing_choice".to_string())
            })?;

            Ok(ChatCompletion {
                model: parsed.model.unwrap_or(request.model),
                provider_request_id: reply.request_id.or(parsed.id),
                content: choice.message.content,
                usage: parsed.usage.map(|usage| TokenUsage {
                    prompt_tokens: clamp_u64_to_u32(usage.prompt_tokens.unwrap_or(0)),
                    completion_tokens: clamp_u64_to_u32(usage.completion_tokens.unwrap_or(0)),
                    total_tokens: clamp_u64_to_u32(usage.total_tokens.unwrap_or(0)),
                }),
            })
        })
    }
}

pub(crate) async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), GatewayError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| GatewayError::Io {
                path: parent.display().to_string(),
                source,
            })?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| GatewayError::Io {
            path: path.display().to_string(),
            source,
        })
}

struct ProviderReply {
    request_id: Option<String>,
    body: Vec<u8>,
}

#[derive(Debug)]
struct SendAttemptError {
    error: GatewayError,
    retryable: bool,
}

impl SendAttemptError {
    fn retryable(error: GatewayError) -> Self {
        Self {
            error,
            retryable: true,
        }
    }

    fn non_retryable(error: GatewayError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatSuccessResponse {
    id: Option<String>,
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn header_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

fn parse_provider_error_code(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ProviderErrorEnvelope {
        error: Option<ProviderErrorDetails>,
    }

    #[derive(Deserialize)]
    struct ProviderErrorDetails {
        code: Option<Value>,
        #[serde(rename = "type")]
        kind: Option<String>,
    }

    let Some(details) = serde_json::from_slice::<ProviderErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error)
    else {
        return "unknown".to_string();
    };

    match (details.code, details.kind) {
        (Some(Value::String(code)), _) => code,
        (Some(Value::Number(code)), _) => code.to_string(),
        (_, Some(kind)) => kind,
        _ => "unknown".to_string(),
    }
}

fn clamp_u64_to_u32(value: u64) -> u32 {
    value.min(u32::MAX as u64) as u32
}
