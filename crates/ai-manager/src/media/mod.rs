//! Image, video and music generation on top of Replicate predictions.

pub mod image;
pub mod music;
pub mod replicate;
pub mod video;

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use uuid::Uuid;

pub use image::{ImageRequest, SUPPORTED_IMAGE_TYPES, aspect_ratio_label, generate_image};
pub use music::{
    MusicMetadata, MusicRequest, generate_music, generate_music_chain, generate_music_variations,
    save_music_metadata,
};
pub use replicate::{Prediction, PredictionStatus, ReplicateClient, ReplicateError, output_url};
pub use video::{VideoRequest, generate_video, generate_video_from_image};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error(transparent)]
    Replicate(#[from] ReplicateError),
    #[error("unsupported file type '{file_type}', expected one of: {supported}")]
    UnsupportedFileType { file_type: String, supported: String },
    #[error("input file not found: {0}")]
    MissingInput(PathBuf),
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// `<prefix>_<uuid>` for callers that do not name their output.
pub fn default_file_name(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// `<folder>/<stem of file_name>.<extension>`.
pub fn output_path(folder: &Path, file_name: &str, extension: &str) -> PathBuf {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or(file_name);
    folder.join(format!("{stem}.{extension}"))
}

pub(crate) async fn write_output(path: &Path, bytes: &[u8]) -> Result<(), MediaError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| MediaError::Io {
                path: parent.display().to_string(),
                source,
            })?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| MediaError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// Reads a local file into a `data:` URI so it can travel inside prediction input.
pub(crate) async fn file_data_uri(path: &Path) -> Result<String, MediaError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| MediaError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(format!(
        "data:{};base64,{}",
        mime_for_path(path),
        STANDARD.encode(bytes)
    ))
}

fn mime_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}
