use std::path::PathBuf;

use serde_json::{Value, json};
use tracing::info;

use super::replicate::ReplicateClient;
use super::{MediaError, output_path, write_output};
use crate::config::ImageDefaults;

pub const SUPPORTED_IMAGE_TYPES: &[&str] = &["png", "jpg", "jpeg", "webp"];

const ASPECT_RATIOS: &[(&str, u32, u32)] = &[
    ("1:1", 1, 1),
    ("16:9", 16, 9),
    ("3:2", 3, 2),
    ("2:3", 2, 3),
    ("4:5", 4, 5),
    ("5:4", 5, 4),
    ("9:16", 9, 16),
    ("3:4", 3, 4),
    ("4:3", 4, 3),
];

const DEFAULT_IMAGE_SIZE: u32 = 512;

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub file_name: String,
    pub folder: PathBuf,
    /// Falls back to the configured output format.
    pub file_type: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl ImageRequest {
    pub fn new(
        prompt: impl Into<String>,
        file_name: impl Into<String>,
        folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            file_name: file_name.into(),
            folder: folder.into(),
            file_type: None,
            width: DEFAULT_IMAGE_SIZE,
            height: DEFAULT_IMAGE_SIZE,
        }
    }
}

/// Named ratio when `width:height` matches one exactly, `custom` otherwise.
pub fn aspect_ratio_label(width: u32, height: u32) -> &'static str {
    ASPECT_RATIOS
        .iter()
        .find(|(_, w, h)| u64::from(width) * u64::from(*h) == u64::from(height) * u64::from(*w))
        .map(|(label, _, _)| *label)
        .unwrap_or("custom")
}

fn resolve_file_type(request: &ImageRequest, defaults: &ImageDefaults) -> Result<String, MediaError> {
    let file_type = request
        .file_type
        .as_deref()
        .unwrap_or(&defaults.output_format)
        .trim()
        .to_ascii_lowercase();
    if SUPPORTED_IMAGE_TYPES.contains(&file_type.as_str()) {
        Ok(file_type)
    } else {
        Err(MediaError::UnsupportedFileType {
            file_type,
            supported: SUPPORTED_IMAGE_TYPES.join(", "),
        })
    }
}

/// Prediction input; the provider is asked for the same format that is saved.
pub fn image_input(request: &ImageRequest, defaults: &ImageDefaults, file_type: &str) -> Value {
    let output_format = if file_type == "jpeg" { "jpg" } else { file_type };
    json!({
        "prompt": request.prompt,
        "width": request.width,
        "height": request.height,
        "aspect_ratio": aspect_ratio_label(request.width, request.height),
        "prompt_upsampling": defaults.prompt_upsampling,
        "output_format": output_format,
        "num_inference_steps": defaults.num_inference_steps,
        "guidance_scale": defaults.guidance_scale,
    })
}

pub async fn generate_image(
    client: &ReplicateClient,
    request: &ImageRequest,
) -> Result<PathBuf, MediaError> {
    let config = client.config();
    let file_type = resolve_file_type(request, &config.image_defaults)?;
    let input = image_input(request, &config.image_defaults, &file_type);
    info!(model = %config.image_model, width = request.width, height = request.height, "generating image");

    let output = client.run(&config.image_model, input).await?;
    let bytes = client.download_output(&output).await?;

    let path = output_path(&request.folder, &request.file_name, &file_type);
    write_output(&path, &bytes).await?;
    info!(path = %path.display(), "image saved");
    Ok(path)
}
