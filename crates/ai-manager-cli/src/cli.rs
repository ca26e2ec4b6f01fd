use std::path::PathBuf;

use ai_manager::llm::PromptData;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use thiserror::Error;

const ROOT_HELP_EXAMPLES: &str = "Examples:\n  ai-manager chat summarize --data '{\"text\": \"...\"}' --validate\n  ai-manager check summarize saved_response.txt\n  ai-manager speak \"Hello there\" --voice nova\n  ai-manager image \"a lighthouse at dusk\" --width 1024 --height 576";

#[derive(Debug, Parser)]
#[command(
    name = "ai-manager",
    about = "Prompted chat, validated structured output, speech and media generation",
    after_help = ROOT_HELP_EXAMPLES
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    #[command(about = "Run a named prompt, optionally validating the reply against its schema")]
    Chat(ChatArgs),
    #[command(about = "List loaded schemas and whether a prompt uses them")]
    Schemas,
    #[command(about = "Sanitize, parse and schema-check a saved model response")]
    Check {
        prompt: String,
        file: PathBuf,
    },
    #[command(about = "Synthesize speech to a wav file")]
    Speak(SpeakArgs),
    #[command(about = "Transcribe an audio file")]
    Transcribe { file: PathBuf },
    #[command(about = "Generate an image via Replicate")]
    Image(ImageArgs),
    #[command(about = "Generate a video via Replicate")]
    Video(VideoArgs),
    #[command(about = "Generate music via Replicate")]
    Music(MusicArgs),
}

#[derive(Debug, Args)]
pub struct ChatArgs {
    pub prompt: String,
    /// JSON object with placeholder values.
    #[arg(long, conflicts_with = "data_file")]
    pub data: Option<String>,
    #[arg(long)]
    pub data_file: Option<PathBuf>,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub validate: bool,
    #[arg(long, requires = "validate")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Args)]
pub struct SpeakArgs {
    pub text: String,
    #[arg(long)]
    pub voice: Option<String>,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub output: Option<PathBuf>,
}

/// Output naming shared by the media subcommands.
#[derive(Debug, Args)]
pub struct OutputArgs {
    /// File name without extension; generated when omitted.
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub folder: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ImageArgs {
    pub prompt: String,
    #[command(flatten)]
    pub output: OutputArgs,
    #[arg(long)]
    pub file_type: Option<String>,
    #[arg(long, default_value_t = 512)]
    pub width: u32,
    #[arg(long, default_value_t = 512)]
    pub height: u32,
}

#[derive(Debug, Args)]
pub struct VideoArgs {
    pub prompt: String,
    #[command(flatten)]
    pub output: OutputArgs,
    #[arg(long, default_value_t = 5)]
    pub duration: u32,
    #[arg(long, default_value = "16:9")]
    pub aspect_ratio: String,
    /// Condition the video on this image.
    #[arg(long)]
    pub image: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct MusicArgs {
    #[arg(required = true)]
    pub prompts: Vec<String>,
    #[command(flatten)]
    pub output: OutputArgs,
    #[arg(long, default_value_t = 30)]
    pub duration: u32,
    #[arg(long, default_value = "wav")]
    pub format: String,
    /// Treat the prompts as consecutive segments, each continuing the last.
    #[arg(long, conflicts_with = "variation")]
    pub chain: bool,
    /// Append a variation to the first prompt; repeatable.
    #[arg(long)]
    pub variation: Vec<String>,
    #[arg(long)]
    pub continue_from: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ai_manager::ConfigError),
    #[error(transparent)]
    Manager(#[from] ai_manager::AiManagerError),
    #[error(transparent)]
    Schema(#[from] ai_manager::llm::SchemaStoreError),
    #[error(transparent)]
    Validated(#[from] ai_manager::llm::ValidatedChatError),
    #[error("--data must be a JSON object: {0}")]
    InvalidData(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("prompt '{0}' produced no response")]
    NoResponse(String),
    #[error("response for prompt '{0}' did not validate")]
    InvalidResponse(String),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Parses `--data` into the placeholder map; absent data is an empty map.
pub fn parse_data(raw: Option<&str>) -> Result<PromptData, CliError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(PromptData::new());
    };

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(CliError::InvalidData(format!(
            "expected an object, got {}",
            json_kind(&other)
        ))),
        Err(err) => Err(CliError::InvalidData(err.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
