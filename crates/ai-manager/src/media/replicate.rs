use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::ReplicateConfig;

const PREFER_HEADER: &str = "Prefer";
const PREFER_WAIT: &str = "wait";

#[derive(Debug, Error)]
pub enum ReplicateError {
    #[error("REPLICATE_API_TOKEN is not configured")]
    MissingApiToken,
    #[error("failed to build Replicate http client: {0}")]
    HttpClient(String),
    #[error("invalid model reference '{0}', expected owner/name or owner/name:version")]
    InvalidModel(String),
    #[error("Replicate request timed out")]
    Timeout,
    #[error("Replicate request failed: {0}")]
    Request(String),
    #[error("Replicate returned status={status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("Replicate returned an invalid payload: {0}")]
    InvalidPayload(String),
    #[error("prediction {id} ended with status {status}: {detail}")]
    PredictionFailed {
        id: String,
        status: String,
        detail: String,
    },
    #[error("prediction {id} did not finish within {waited_secs}s")]
    TimedOut { id: String, waited_secs: u64 },
    #[error("prediction output contains no downloadable url")]
    MissingOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl PredictionStatus {
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Starting | Self::Processing)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub urls: Option<PredictionUrls>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionUrls {
    pub get: Option<String>,
}

/// `owner/name` runs the latest deployment; `owner/name:version` pins a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelRef<'a> {
    Latest { owner: &'a str, name: &'a str },
    Version(&'a str),
}

impl<'a> ModelRef<'a> {
    pub fn parse(model: &'a str) -> Result<Self, ReplicateError> {
        let invalid = || ReplicateError::InvalidModel(model.to_string());
        let (path, version) = match model.split_once(':') {
            Some((path, version)) => (path, Some(version)),
            None => (model, None),
        };
        let (owner, name) = path.split_once('/').ok_or_else(invalid)?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }

        match version {
            Some(version) if version.is_empty() => Err(invalid()),
            Some(version) => Ok(Self::Version(version)),
            None => Ok(Self::Latest { owner, name }),
        }
    }
}

/// Client for Replicate's prediction API.
#[derive(Clone)]
pub struct ReplicateClient {
    client: reqwest::Client,
    config: ReplicateConfig,
}

impl ReplicateClient {
    pub fn new(config: ReplicateConfig) -> Result<Self, ReplicateError> {
        if config.api_token.trim().is_empty() {
            return Err(ReplicateError::MissingApiToken);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| ReplicateError::HttpClient(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ReplicateConfig {
        &self.config
    }

    /// Creates a prediction, waits for a terminal status and returns its output.
    pub async fn run(&self, model: &str, input: Value) -> Result<Value, ReplicateError> {
        let started = Instant::now();
        let prediction = self.create_prediction(model, input).await?;
        let prediction = self.wait_for(prediction).await?;
        info!(
            model,
            prediction_id = %prediction.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "prediction succeeded"
        );
        prediction.output.ok_or(ReplicateError::MissingOutput)
    }

    pub async fn create_prediction(
        &self,
        model: &str,
        input: Value,
    ) -> Result<Prediction, ReplicateError> {
        let (url, body) = match ModelRef::parse(model)? {
            ModelRef::Latest { owner, name } => (
                self.endpoint(&format!("models/{owner}/{name}/predictions")),
                json!({ "input": input }),
            ),
            ModelRef::Version(version) => (
                self.endpoint("predictions"),
                json!({ "version": version, "input": input }),
            ),
        };

        debug!(model, "creating prediction");
        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_token)
            .header(PREFER_HEADER, PREFER_WAIT)
            .json(&body);
        self.send_for_prediction(request).await
    }

    /// Polls until the prediction leaves `starting`/`processing`.
    pub async fn wait_for(&self, mut prediction: Prediction) -> Result<Prediction, ReplicateError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.max_wait_seconds);
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        while prediction.status.is_pending() {
            if Instant::now() >= deadline {
                return Err(ReplicateError::TimedOut {
                    id: prediction.id,
                    waited_secs: self.config.max_wait_seconds,
                });
            }
            sleep(interval).await;

            let poll_url = prediction
                .urls
                .as_ref()
                .and_then(|urls| urls.get.clone())
                .unwrap_or_else(|| self.endpoint(&format!("predictions/{}", prediction.id)));
            let request = self
                .client
                .get(&poll_url)
                .bearer_auth(&self.config.api_token);
            prediction = self.send_for_prediction(request).await?;
            debug!(prediction_id = %prediction.id, status = prediction.status.as_str(), "polled prediction");
        }

        match prediction.status {
            PredictionStatus::Succeeded => Ok(prediction),
            status => {
                let detail = match &prediction.error {
                    Some(Value::String(message)) => message.clone(),
                    Some(other) => other.to_string(),
                    None => "no error detail".to_string(),
                };
                warn!(prediction_id = %prediction.id, status = status.as_str(), "prediction did not succeed");
                Err(ReplicateError::PredictionFailed {
                    id: prediction.id,
                    status: status.as_str().to_string(),
                    detail,
                })
            }
        }
    }

    pub async fn download(&self, url: &str) -> Result<Vec<u8>, ReplicateError> {
        let response = self.client.get(url).send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReplicateError::Api {
                status: status.as_u16(),
                detail: format!("download of {url} failed"),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| ReplicateError::Request(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Downloads the first URL found in a prediction output.
    pub async fn download_output(&self, output: &Value) -> Result<Vec<u8>, ReplicateError> {
        let url = output_url(output).ok_or(ReplicateError::MissingOutput)?;
        debug!(url, "downloading prediction output");
        self.download(url).await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn send_for_prediction(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Prediction, ReplicateError> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|_| ReplicateError::InvalidPayload("response_body_read_failed".to_string()))?;

        if !status.is_success() {
            return Err(ReplicateError::Api {
                status: status.as_u16(),
                detail: parse_error_detail(status, &body),
            });
        }

        serde_json::from_str(&body)
            .map_err(|_| ReplicateError::InvalidPayload("prediction_json_parse_failed".to_string()))
    }
}

/// An `http*` string, or the first such string in an array.
pub fn output_url(output: &Value) -> Option<&str> {
    match output {
        Value::String(url) if url.starts_with("http") => Some(url.as_str()),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .find(|url| url.starts_with("http")),
        _ => None,
    }
}

fn map_transport_error(err: reqwest::Error) -> ReplicateError {
    if err.is_timeout() {
        ReplicateError::Timeout
    } else {
        ReplicateError::Request("request_unavailable".to_string())
    }
}

fn parse_error_detail(status: StatusCode, body: &str) -> String {
    #[derive(Deserialize)]
    struct ProblemDetails {
        detail: Option<String>,
        title: Option<String>,
    }

    serde_json::from_str::<ProblemDetails>(body)
        .ok()
        .and_then(|problem| problem.detail.or(problem.title))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown")
                .to_string()
        })
}
