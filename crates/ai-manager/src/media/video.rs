use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing::{info, warn};

use super::replicate::ReplicateClient;
use super::{MediaError, file_data_uri, output_path, write_output};

pub const VALID_DURATIONS: &[u32] = &[5, 10, 15, 20];
pub const VALID_ASPECT_RATIOS: &[&str] = &["16:9", "9:16", "1:1", "4:3", "3:4"];

const DEFAULT_DURATION: u32 = 5;
const DEFAULT_ASPECT_RATIO: &str = "16:9";
const VIDEO_EXTENSION: &str = "mp4";

#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub prompt: String,
    pub file_name: String,
    pub folder: PathBuf,
    pub duration: u32,
    pub aspect_ratio: String,
}

impl VideoRequest {
    pub fn new(
        prompt: impl Into<String>,
        file_name: impl Into<String>,
        folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            file_name: file_name.into(),
            folder: folder.into(),
            duration: DEFAULT_DURATION,
            aspect_ratio: DEFAULT_ASPECT_RATIO.to_string(),
        }
    }

    fn normalized_duration(&self) -> u32 {
        if VALID_DURATIONS.contains(&self.duration) {
            self.duration
        } else {
            warn!(duration = self.duration, "invalid video duration, using {DEFAULT_DURATION} seconds");
            DEFAULT_DURATION
        }
    }

    fn normalized_aspect_ratio(&self) -> &str {
        if VALID_ASPECT_RATIOS.contains(&self.aspect_ratio.as_str()) {
            &self.aspect_ratio
        } else {
            warn!(aspect_ratio = %self.aspect_ratio, "invalid video aspect ratio, using {DEFAULT_ASPECT_RATIO}");
            DEFAULT_ASPECT_RATIO
        }
    }
}

pub fn video_input(request: &VideoRequest) -> Value {
    json!({
        "prompt": request.prompt,
        "duration": request.normalized_duration(),
        "aspect_ratio": request.normalized_aspect_ratio(),
    })
}

pub async fn generate_video(
    client: &ReplicateClient,
    request: &VideoRequest,
) -> Result<PathBuf, MediaError> {
    run_video(client, request, video_input(request)).await
}

/// Conditions the video on a local image, sent inline as a data URI.
pub async fn generate_video_from_image(
    client: &ReplicateClient,
    image_path: &Path,
    request: &VideoRequest,
) -> Result<PathBuf, MediaError> {
    if !image_path.is_file() {
        return Err(MediaError::MissingInput(image_path.to_path_buf()));
    }

    let mut input = video_input(request);
    input["image"] = Value::String(file_data_uri(image_path).await?);
    info!(image = %image_path.display(), "generating video from image");
    run_video(client, request, input).await
}

async fn run_video(
    client: &ReplicateClient,
    request: &VideoRequest,
    input: Value,
) -> Result<PathBuf, MediaError> {
    let model = &client.config().video_model;
    info!(model = %model, duration = %input["duration"], "generating video");

    let output = client.run(model, input).await?;
    let bytes = client.download_output(&output).await?;

    let path = output_path(&request.folder, &request.file_name, VIDEO_EXTENSION);
    write_output(&path, &bytes).await?;
    info!(path = %path.display(), "video saved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::{VideoRequest, video_input};

    #[test]
    fn invalid_duration_and_ratio_fall_back_to_defaults() {
        let mut request = VideoRequest::new("waves", "waves", "out");
        request.duration = 7;
        request.aspect_ratio = "21:9".to_string();

        let input = video_input(&request);
        assert_eq!(input["duration"], 5);
        assert_eq!(input["aspect_ratio"], "16:9");
    }

    #[test]
    fn valid_settings_pass_through() {
        let mut request = VideoRequest::new("waves", "waves", "out");
        request.duration = 15;
        request.aspect_ratio = "9:16".to_string();

        let input = video_input(&request);
        assert_eq!(input["duration"], 15);
        assert_eq!(input["aspect_ratio"], "9:16");
        assert_eq!(input["prompt"], "waves");
    }
}
