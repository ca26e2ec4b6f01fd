use std::fs;
use std::path::PathBuf;

use thiserror::Error;

use crate::config_env::{
    optional_trimmed_env, parse_bool_env, parse_f64_env, parse_u32_env, parse_u64_env, path_env,
    require_env, string_env, url_env,
};

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_OPENAI_MAX_RETRIES: u32 = 2;
const DEFAULT_OPENAI_RETRY_BASE_BACKOFF_MS: u64 = 250;

const DEFAULT_REPLICATE_BASE_URL: &str = "https://api.replicate.com/v1";
const DEFAULT_REPLICATE_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_REPLICATE_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_REPLICATE_MAX_WAIT_SECONDS: u64 = 600;
const DEFAULT_REPLICATE_CHAIN_DELAY_MS: u64 = 2_000;

pub const DEFAULT_IMAGE_MODEL: &str = "black-forest-labs/flux-pro";
pub const DEFAULT_VIDEO_MODEL: &str = "google/veo-2";
pub const DEFAULT_MUSIC_MODEL: &str = "meta/musicgen";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    MissingVar(String),
    #[error("invalid integer in env var {0}")]
    ParseInt(String),
    #[error("invalid number in env var {0}")]
    ParseFloat(String),
    #[error("invalid boolean in env var {0}")]
    ParseBool(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Clone)]
pub struct AiManagerConfig {
    pub prompt_folder: PathBuf,
    pub schema_folder: PathBuf,
    pub output_dir: PathBuf,
    pub chat_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub whisper_model: String,
    pub max_validation_retries: u32,
    pub validation_retry_delay_ms: u64,
    /// Custom augmentation template using `{base_prompt}` and `{schema_example}`.
    pub schema_prompt_template: Option<String>,
    pub openai: OpenAiConfig,
    pub replicate: Option<ReplicateConfig>,
}

impl AiManagerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let content = ContentConfig::from_env();
        Ok(Self {
            prompt_folder: content.prompt_folder,
            schema_folder: content.schema_folder,
            output_dir: path_env("AI_MANAGER_OUTPUT_DIR", "output"),
            chat_model: string_env("AI_MANAGER_CHAT_MODEL", "gpt-4o-mini"),
            tts_model: string_env("AI_MANAGER_TTS_MODEL", "tts-1"),
            tts_voice: string_env("AI_MANAGER_TTS_VOICE", "alloy"),
            whisper_model: string_env("AI_MANAGER_WHISPER_MODEL", "whisper-1"),
            max_validation_retries: parse_u32_env("AI_MANAGER_MAX_VALIDATION_RETRIES", 3)?,
            validation_retry_delay_ms: parse_u64_env("AI_MANAGER_VALIDATION_RETRY_DELAY_MS", 0)?,
            schema_prompt_template: schema_prompt_template_from_env()?,
            openai: OpenAiConfig::from_env()?,
            replicate: ReplicateConfig::from_env()?,
        })
    }
}

/// Prompt and schema folders. Reading them needs no credentials.
#[derive(Debug, Clone)]
pub struct ContentConfig {
    pub prompt_folder: PathBuf,
    pub schema_folder: PathBuf,
}

impl ContentConfig {
    pub fn from_env() -> Self {
        Self {
            prompt_folder: path_env("AI_MANAGER_PROMPT_FOLDER", "prompts"),
            schema_folder: path_env("AI_MANAGER_SCHEMA_FOLDER", "schemas"),
        }
    }
}

fn schema_prompt_template_from_env() -> Result<Option<String>, ConfigError> {
    if let Some(template) = optional_trimmed_env("AI_MANAGER_SCHEMA_PROMPT_TEMPLATE") {
        return Ok(Some(template));
    }

    let Some(path) = optional_trimmed_env("AI_MANAGER_SCHEMA_PROMPT_TEMPLATE_FILE") else {
        return Ok(None);
    };
    fs::read_to_string(&path).map(Some).map_err(|err| {
        ConfigError::InvalidConfiguration(format!(
            "AI_MANAGER_SCHEMA_PROMPT_TEMPLATE_FILE {path} could not be read: {err}"
        ))
    })
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub organization_id: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_backoff_ms: u64,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            api_key: api_key.into(),
            organization_id: None,
            timeout_ms: DEFAULT_OPENAI_TIMEOUT_MS,
            max_retries: DEFAULT_OPENAI_MAX_RETRIES,
            retry_base_backoff_ms: DEFAULT_OPENAI_RETRY_BASE_BACKOFF_MS,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: url_env("OPENAI_BASE_URL", DEFAULT_OPENAI_BASE_URL)?,
            api_key: require_env("OPENAI_API_KEY")?,
            organization_id: optional_trimmed_env("OPENAI_ORGANIZATION_ID"),
            timeout_ms: parse_u64_env("OPENAI_TIMEOUT_MS", DEFAULT_OPENAI_TIMEOUT_MS)?,
            max_retries: parse_u32_env("OPENAI_MAX_RETRIES", DEFAULT_OPENAI_MAX_RETRIES)?,
            retry_base_backoff_ms: parse_u64_env(
                "OPENAI_RETRY_BASE_BACKOFF_MS",
                DEFAULT_OPENAI_RETRY_BASE_BACKOFF_MS,
            )?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImageDefaults {
    pub prompt_upsampling: bool,
    pub output_format: String,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self {
            prompt_upsampling: true,
            output_format: "png".to_string(),
            num_inference_steps: 50,
            guidance_scale: 7.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_wait_seconds: u64,
    pub chain_delay_ms: u64,
    pub image_model: String,
    pub video_model: String,
    pub music_model: String,
    pub image_defaults: ImageDefaults,
}

impl ReplicateConfig {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_REPLICATE_BASE_URL.to_string(),
            api_token: api_token.into(),
            timeout_ms: DEFAULT_REPLICATE_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_REPLICATE_POLL_INTERVAL_MS,
            max_wait_seconds: DEFAULT_REPLICATE_MAX_WAIT_SECONDS,
            chain_delay_ms: DEFAULT_REPLICATE_CHAIN_DELAY_MS,
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            video_model: DEFAULT_VIDEO_MODEL.to_string(),
            music_model: DEFAULT_MUSIC_MODEL.to_string(),
            image_defaults: ImageDefaults::default(),
        }
    }

    /// Returns `None` when `REPLICATE_API_TOKEN` is not set.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(api_token) = optional_trimmed_env("REPLICATE_API_TOKEN") else {
            return Ok(None);
        };

        let defaults = ImageDefaults::default();
        Ok(Some(Self {
            base_url: url_env("REPLICATE_BASE_URL", DEFAULT_REPLICATE_BASE_URL)?,
            api_token,
            timeout_ms: parse_u64_env("REPLICATE_TIMEOUT_MS", DEFAULT_REPLICATE_TIMEOUT_MS)?,
            poll_interval_ms: parse_u64_env(
                "REPLICATE_POLL_INTERVAL_MS",
                DEFAULT_REPLICATE_POLL_INTERVAL_MS,
            )?,
            max_wait_seconds: parse_u64_env(
                "REPLICATE_MAX_WAIT_SECONDS",
                DEFAULT_REPLICATE_MAX_WAIT_SECONDS,
            )?,
            chain_delay_ms: parse_u64_env(
                "REPLICATE_CHAIN_DELAY_MS",
                DEFAULT_REPLICATE_CHAIN_DELAY_MS,
            )?,
            image_model: string_env("REPLICATE_IMAGE_MODEL", DEFAULT_IMAGE_MODEL),
            video_model: string_env("REPLICATE_VIDEO_MODEL", DEFAULT_VIDEO_MODEL),
            music_model: string_env("REPLICATE_MUSIC_MODEL", DEFAULT_MUSIC_MODEL),
            image_defaults: ImageDefaults {
                prompt_upsampling: parse_bool_env(
                    "REPLICATE_IMAGE_PROMPT_UPSAMPLING",
                    defaults.prompt_upsampling,
                )?,
                output_format: string_env(
                    "REPLICATE_IMAGE_OUTPUT_FORMAT",
                    &defaults.output_format,
                ),
                num_inference_steps: parse_u32_env(
                    "REPLICATE_IMAGE_INFERENCE_STEPS",
                    defaults.num_inference_steps,
                )?,
                guidance_scale: parse_f64_env(
                    "REPLICATE_IMAGE_GUIDANCE_SCALE",
                    defaults.guidance_scale,
                )?,
            },
        }))
    }
}
