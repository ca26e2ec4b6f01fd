use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::replicate::ReplicateClient;
use super::{MediaError, file_data_uri, output_path, write_output};

pub const MAX_PROMPT_CHARS: usize = 200;
const SUPPORTED_AUDIO_TYPES: &[&str] = &["wav", "mp3"];
const DEFAULT_AUDIO_TYPE: &str = "wav";
const NORMALIZATION_STRATEGY: &str = "loudness";

#[derive(Debug, Clone)]
pub struct MusicRequest {
    pub prompt: String,
    pub file_name: String,
    pub folder: PathBuf,
    pub duration: u32,
    pub continuation_audio: Option<PathBuf>,
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub classifier_free_guidance: f64,
    pub output_format: String,
}

impl MusicRequest {
    pub fn new(
        prompt: impl Into<String>,
        file_name: impl Into<String>,
        folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            file_name: file_name.into(),
            folder: folder.into(),
            duration: 30,
            continuation_audio: None,
            temperature: 1.0,
            top_k: 250,
            top_p: 0.0,
            classifier_free_guidance: 3.0,
            output_format: DEFAULT_AUDIO_TYPE.to_string(),
        }
    }

    fn truncated_prompt(&self) -> String {
        self.prompt.chars().take(MAX_PROMPT_CHARS).collect()
    }

    fn extension(&self) -> &str {
        let format = self.output_format.as_str();
        SUPPORTED_AUDIO_TYPES
            .iter()
            .find(|supported| supported.eq_ignore_ascii_case(format))
            .copied()
            .unwrap_or(DEFAULT_AUDIO_TYPE)
    }
}

/// Sidecar written next to each generated track as `<track>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicMetadata {
    pub prompt: String,
    pub duration: u32,
    pub generated_at: DateTime<Utc>,
    pub continuation_from: Option<String>,
    pub file_path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Builds prediction input, inlining continuation audio when the file exists.
pub async fn music_input(request: &MusicRequest) -> Result<Value, MediaError> {
    let mut input = json!({
        "prompt": request.truncated_prompt(),
        "duration": request.duration,
        "output_format": request.extension(),
        "temperature": request.temperature,
        "top_k": request.top_k,
        "top_p": request.top_p,
        "classifier_free_guidance": request.classifier_free_guidance,
        "normalization_strategy": NORMALIZATION_STRATEGY,
        "continuation": false,
    });

    match request.continuation_audio.as_deref() {
        Some(path) if path.is_file() => {
            info!(path = %path.display(), "continuing from previous audio");
            input["input_audio"] = Value::String(file_data_uri(path).await?);
            input["continuation"] = Value::Bool(true);
        }
        Some(path) => warn!(path = %path.display(), "continuation audio not found"),
        None => {}
    }

    Ok(input)
}

/// Generates one track and writes its metadata sidecar.
pub async fn generate_music(
    client: &ReplicateClient,
    request: &MusicRequest,
) -> Result<PathBuf, MediaError> {
    let model = &client.config().music_model;
    let input = music_input(request).await?;
    info!(model = %model, duration = request.duration, "generating music");

    let output = client.run(model, input).await?;
    let bytes = client.download_output(&output).await?;

    let path = output_path(&request.folder, &request.file_name, request.extension());
    write_output(&path, &bytes).await?;
    info!(path = %path.display(), "music saved");

    let metadata = MusicMetadata {
        prompt: request.prompt.clone(),
        duration: request.duration,
        generated_at: Utc::now(),
        continuation_from: request
            .continuation_audio
            .as_ref()
            .map(|path| path.display().to_string()),
        file_path: path.display().to_string(),
        extra: Map::new(),
    };
    save_music_metadata(&path, &metadata).await?;
    Ok(path)
}

/// Each segment continues from the last one that succeeded. Failed segments
/// are logged and skipped.
pub async fn generate_music_chain(
    client: &ReplicateClient,
    prompts: &[String],
    folder: &Path,
    base_file_name: &str,
    duration: u32,
) -> Vec<PathBuf> {
    info!(segments = prompts.len(), "starting music continuation chain");
    let mut generated = Vec::new();
    let mut last_audio: Option<PathBuf> = None;

    for (index, prompt) in prompts.iter().enumerate() {
        let mut request = MusicRequest::new(
            prompt.clone(),
            format!("{base_file_name}_{index:03}"),
            folder,
        );
        request.duration = duration;
        request.continuation_audio = last_audio.clone();

        match generate_music(client, &request).await {
            Ok(path) => {
                info!(segment = index + 1, "segment generated");
                last_audio = Some(path.clone());
                generated.push(path);
            }
            Err(err) => error!(segment = index + 1, "failed to generate segment: {err}"),
        }

        pause_between(client, index, prompts.len()).await;
    }

    info!(generated = generated.len(), requested = prompts.len(), "music chain complete");
    generated
}

/// Generates `"<base>, <variation>"` for every variation.
pub async fn generate_music_variations(
    client: &ReplicateClient,
    base_prompt: &str,
    variations: &[String],
    folder: &Path,
    base_file_name: &str,
    duration: u32,
) -> Vec<PathBuf> {
    info!(variations = variations.len(), "generating music variations");
    let mut generated = Vec::new();

    for (index, variation) in variations.iter().enumerate() {
        let mut request = MusicRequest::new(
            format!("{base_prompt}, {variation}"),
            format!("{base_file_name}_{index:03}"),
            folder,
        );
        request.duration = duration;

        match generate_music(client, &request).await {
            Ok(path) => generated.push(path),
            Err(err) => error!(variation = index + 1, "failed to generate variation: {err}"),
        }

        pause_between(client, index, variations.len()).await;
    }

    generated
}

async fn pause_between(client: &ReplicateClient, index: usize, total: usize) {
    let delay_ms = client.config().chain_delay_ms;
    if index + 1 < total && delay_ms > 0 {
        sleep(Duration::from_millis(delay_ms)).await;
    }
}

pub async fn save_music_metadata(
    audio_path: &Path,
    metadata: &MusicMetadata,
) -> Result<PathBuf, MediaError> {
    let metadata_path = audio_path.with_extension("json");
    let encoded = serde_json::to_vec_pretty(metadata)?;
    write_output(&metadata_path, &encoded).await?;
    debug!(path = %metadata_path.display(), "saved music metadata");
    Ok(metadata_path)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::{Map, Value};

    use super::{MusicMetadata, MusicRequest, music_input, save_music_metadata};

    #[tokio::test]
    async fn input_truncates_prompt_and_applies_defaults() {
        let request = MusicRequest::new("x".repeat(250), "track", "out");
        let input = music_input(&request).await.expect("input builds");

        assert_eq!(input["prompt"].as_str().map(str::len), Some(200));
        assert_eq!(input["duration"], 30);
        assert_eq!(input["top_k"], 250);
        assert_eq!(input["classifier_free_guidance"], 3.0);
        assert_eq!(input["normalization_strategy"], "loudness");
        assert_eq!(input["continuation"], false);
        assert!(input.get("input_audio").is_none());
    }

    #[tokio::test]
    async fn missing_continuation_audio_disables_continuation() {
        let mut request = MusicRequest::new("calm piano", "track", "out");
        request.continuation_audio = Some("/no/such/previous.wav".into());
        request.output_format = "flac".to_string();

        let input = music_input(&request).await.expect("input builds");
        assert_eq!(input["continuation"], false);
        assert_eq!(input["output_format"], "wav");
    }

    #[tokio::test]
    async fn existing_continuation_audio_is_inlined() {
        let dir = tempfile::tempdir().expect("tempdir");
        let previous = dir.path().join("previous.mp3");
        std::fs::write(&previous, b"ID3").expect("write");

        let mut request = MusicRequest::new("calm piano", "track", dir.path());
        request.continuation_audio = Some(previous);

        let input = music_input(&request).await.expect("input builds");
        assert_eq!(input["continuation"], true);
        assert_eq!(input["input_audio"], "data:audio/mpeg;base64,SUQz");
    }

    #[tokio::test]
    async fn metadata_sidecar_sits_next_to_audio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let audio = dir.path().join("track_000.wav");
        let mut extra = Map::new();
        extra.insert("segment".to_string(), Value::from(0));

        let sidecar = save_music_metadata(
            &audio,
            &MusicMetadata {
                prompt: "calm piano".to_string(),
                duration: 30,
                generated_at: Utc::now(),
                continuation_from: None,
                file_path: audio.display().to_string(),
                extra,
            },
        )
        .await
        .expect("metadata written");

        assert_eq!(sidecar, dir.path().join("track_000.json"));
        let written: Value =
            serde_json::from_slice(&std::fs::read(&sidecar).expect("read")).expect("json");
        assert_eq!(written["prompt"], "calm piano");
        assert_eq!(written["segment"], 0);
        assert!(written["continuation_from"].is_null());
    }
}
