use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{AiManagerConfig, ConfigError};
use crate::llm::chat::{GatewayInvoker, ModelInvoker, chat};
use crate::llm::formatter::PromptData;
use crate::llm::gateway::GatewayError;
use crate::llm::openai::{AudioSource, OpenAiClient, SpeechRequest};
use crate::llm::parser::ValidationResult;
use crate::llm::schema_store::{SchemaStore, SchemaStoreError};
use crate::llm::validated::{
    SchemaPromptTemplate, ValidatedChatError, ValidationOrchestrator, check_response,
};
use crate::media::{
    self, ImageRequest, MediaError, MusicRequest, ReplicateClient, ReplicateError, VideoRequest,
};
use crate::prompts::PromptTable;

#[derive(Debug, Error)]
pub enum AiManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Schema(#[from] SchemaStoreError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("OpenAI client is not configured")]
    OpenAiNotConfigured,
    #[error("Replicate client is not configured; set REPLICATE_API_TOKEN")]
    ReplicateNotConfigured,
}

impl From<ReplicateError> for AiManagerError {
    fn from(err: ReplicateError) -> Self {
        Self::Media(MediaError::Replicate(err))
    }
}

/// Defaults applied when a call does not name a model, voice or folder.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub chat_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub whisper_model: String,
    pub output_dir: PathBuf,
    pub max_validation_retries: u32,
    pub validation_retry_delay: Duration,
    pub schema_prompt_template: SchemaPromptTemplate,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            chat_model: "gpt-4o-mini".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            whisper_model: "whisper-1".to_string(),
            output_dir: PathBuf::from("output"),
            max_validation_retries: 3,
            validation_retry_delay: Duration::ZERO,
            schema_prompt_template: SchemaPromptTemplate::default(),
        }
    }
}

impl ManagerSettings {
    pub fn from_config(config: &AiManagerConfig) -> Self {
        Self {
            chat_model: config.chat_model.clone(),
            tts_model: config.tts_model.clone(),
            tts_voice: config.tts_voice.clone(),
            whisper_model: config.whisper_model.clone(),
            output_dir: config.output_dir.clone(),
            max_validation_retries: config.max_validation_retries,
            validation_retry_delay: Duration::from_millis(config.validation_retry_delay_ms),
            schema_prompt_template: config
                .schema_prompt_template
                .as_deref()
                .map(SchemaPromptTemplate::new)
                .unwrap_or_default(),
        }
    }
}

/// Single entry point over prompts, schemas and the vendor clients.
pub struct AiManager {
    settings: ManagerSettings,
    prompts: PromptTable,
    schemas: SchemaStore,
    invoker: Arc<dyn ModelInvoker>,
    openai: Option<OpenAiClient>,
    replicate: Option<ReplicateClient>,
}

impl AiManager {
    pub fn from_config(config: AiManagerConfig) -> Result<Self, AiManagerError> {
        let openai = OpenAiClient::new(config.openai.clone())?;
        let prompts = PromptTable::load_dir(&config.prompt_folder);
        let schemas = SchemaStore::new();
        schemas.load(&config.schema_folder)?;

        let replicate = match config.replicate.clone() {
            Some(replicate_config) => Some(ReplicateClient::new(replicate_config)?),
            None => {
                info!("REPLICATE_API_TOKEN not set; media generation disabled");
                None
            }
        };

        let manager = Self::with_parts(
            ManagerSettings::from_config(&config),
            prompts,
            schemas,
            Arc::new(GatewayInvoker::new(openai.clone())),
        )
        .with_openai(openai);
        Ok(match replicate {
            Some(client) => manager.with_replicate(client),
            None => manager,
        })
    }

    pub fn with_parts(
        settings: ManagerSettings,
        prompts: PromptTable,
        schemas: SchemaStore,
        invoker: Arc<dyn ModelInvoker>,
    ) -> Self {
        Self {
            settings,
            prompts,
            schemas,
            invoker,
            openai: None,
            replicate: None,
        }
    }

    pub fn with_openai(mut self, client: OpenAiClient) -> Self {
        self.openai = Some(client);
        self
    }

    pub fn with_replicate(mut self, client: ReplicateClient) -> Self {
        self.replicate = Some(client);
        self
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn prompts(&self) -> &PromptTable {
        &self.prompts
    }

    pub fn schemas(&self) -> &SchemaStore {
        &self.schemas
    }

    /// One unvalidated call; failures are logged and yield `None`.
    pub async fn chat(
        &self,
        prompt_name: &str,
        data: &PromptData,
        model: Option<&str>,
    ) -> Option<String> {
        let model = model.unwrap_or(&self.settings.chat_model);
        chat(self.invoker.as_ref(), &self.prompts, prompt_name, data, model).await
    }

    /// Retries until the reply parses and matches the prompt's schema.
    pub async fn chat_validated(
        &self,
        prompt_name: &str,
        data: &PromptData,
        model: Option<&str>,
    ) -> Result<Value, ValidatedChatError> {
        self.chat_validated_with_retries(
            prompt_name,
            data,
            model,
            self.settings.max_validation_retries,
        )
        .await
    }

    pub async fn chat_validated_with_retries(
        &self,
        prompt_name: &str,
        data: &PromptData,
        model: Option<&str>,
        max_retries: u32,
    ) -> Result<Value, ValidatedChatError> {
        let model = model.unwrap_or(&self.settings.chat_model);
        self.orchestrator()
            .generate_validated(prompt_name, data, model, max_retries)
            .await
    }

    pub fn orchestrator(&self) -> ValidationOrchestrator<'_> {
        ValidationOrchestrator::new(self.invoker.as_ref(), &self.prompts, &self.schemas)
            .with_template(self.settings.schema_prompt_template.clone())
            .with_retry_delay(self.settings.validation_retry_delay)
    }

    /// Prompt names that also have a schema, sorted.
    pub fn schema_prompts(&self) -> Vec<String> {
        self.schemas
            .names()
            .into_iter()
            .filter(|name| self.prompts.contains(name))
            .collect()
    }

    pub fn validate_response_for_prompt(&self, response: &str, prompt_name: &str) -> ValidationResult {
        match check_response(response, prompt_name, &self.schemas) {
            Ok(result) => result,
            Err(failure) => failure.into_validation_result().unwrap_or_else(|| {
                ValidationResult::failed(Vec::new(), String::new())
            }),
        }
    }

    pub fn has_schema_for_prompt(&self, prompt_name: &str) -> bool {
        self.schemas.has(prompt_name)
    }

    pub fn validate_data(&self, data: &Value, schema_name: &str) -> ValidationResult {
        self.schemas.validate(data, schema_name)
    }

    pub fn add_schema(&self, name: &str, schema: Value) -> Result<(), SchemaStoreError> {
        self.schemas.add(name, schema)
    }

    pub fn available_schemas(&self) -> Vec<String> {
        self.schemas.names()
    }

    fn openai(&self) -> Result<&OpenAiClient, AiManagerError> {
        self.openai.as_ref().ok_or(AiManagerError::OpenAiNotConfigured)
    }

    fn replicate(&self) -> Result<&ReplicateClient, AiManagerError> {
        self.replicate.as_ref().ok_or_else(|| {
            error!("Replicate client not initialized");
            AiManagerError::ReplicateNotConfigured
        })
    }

    fn media_folder(&self, kind: &str) -> PathBuf {
        self.settings.output_dir.join(kind)
    }

    /// Writes a wav file; defaults to `<output_dir>/speech/speech_<uuid>.wav`.
    pub async fn generate_speech(
        &self,
        text: &str,
        voice: Option<&str>,
        model: Option<&str>,
        output_path: Option<&Path>,
    ) -> Result<PathBuf, AiManagerError> {
        let client = self.openai()?;
        let output_path = match output_path {
            Some(path) => path.to_path_buf(),
            None => media::output_path(
                &self.media_folder("speech"),
                &media::default_file_name("speech"),
                "wav",
            ),
        };
        let request = SpeechRequest {
            model: model.unwrap_or(&self.settings.tts_model).to_string(),
            voice: voice.unwrap_or(&self.settings.tts_voice).to_string(),
            input: text.to_string(),
        };

        Ok(client.generate_speech(&request, &output_path).await?)
    }

    pub async fn transcribe_audio(&self, audio: AudioSource) -> Result<String, AiManagerError> {
        let client = self.openai()?;
        let text = client.transcribe(audio, &self.settings.whisper_model).await?;
        if text.trim().is_empty() {
            warn!("transcription returned no text");
        }
        Ok(text)
    }

    /// Request rooted at `<output_dir>/images` with a generated file name.
    pub fn image_request(&self, prompt: impl Into<String>) -> ImageRequest {
        ImageRequest::new(
            prompt,
            media::default_file_name("flux_image"),
            self.media_folder("images"),
        )
    }

    pub async fn generate_image(&self, request: &ImageRequest) -> Result<PathBuf, AiManagerError> {
        Ok(media::generate_image(self.replicate()?, request).await?)
    }

    pub fn video_request(&self, prompt: impl Into<String>) -> VideoRequest {
        VideoRequest::new(
            prompt,
            media::default_file_name("veo_video"),
            self.media_folder("videos"),
        )
    }

    pub async fn generate_video(&self, request: &VideoRequest) -> Result<PathBuf, AiManagerError> {
        Ok(media::generate_video(self.replicate()?, request).await?)
    }

    pub async fn generate_video_from_image(
        &self,
        image_path: &Path,
        request: &VideoRequest,
    ) -> Result<PathBuf, AiManagerError> {
        Ok(media::generate_video_from_image(self.replicate()?, image_path, request).await?)
    }

    pub fn music_request(&self, prompt: impl Into<String>) -> MusicRequest {
        MusicRequest::new(
            prompt,
            media::default_file_name("music"),
            self.media_folder("music"),
        )
    }

    pub async fn generate_music(&self, request: &MusicRequest) -> Result<PathBuf, AiManagerError> {
        Ok(media::generate_music(self.replicate()?, request).await?)
    }

    pub async fn generate_music_chain(
        &self,
        prompts: &[String],
        folder: Option<&Path>,
        base_file_name: &str,
        duration: u32,
    ) -> Result<Vec<PathBuf>, AiManagerError> {
        let client = self.replicate()?;
        let folder = folder
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.media_folder("music"));
        Ok(media::generate_music_chain(client, prompts, &folder, base_file_name, duration).await)
    }

    pub async fn generate_music_variations(
        &self,
        base_prompt: &str,
        variations: &[String],
        folder: Option<&Path>,
        base_file_name: &str,
        duration: u32,
    ) -> Result<Vec<PathBuf>, AiManagerError> {
        let client = self.replicate()?;
        let folder = folder
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.media_folder("music"));
        Ok(media::generate_music_variations(
            client,
            base_prompt,
            variations,
            &folder,
            base_file_name,
            duration,
        )
        .await)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{AiManager, AiManagerError, ManagerSettings};
    use crate::config::AiManagerConfig;
    use crate::llm::chat::{InvokeFuture, ModelInvoker};
    use crate::llm::formatter::PromptData;
    use crate::llm::schema_store::SchemaStore;
    use crate::prompts::{Prompt, PromptTable};

    struct SilentInvoker;

    impl ModelInvoker for SilentInvoker {
        fn invoke<'a>(
            &'a self,
            _prompt_name: &'a str,
            _data: &'a PromptData,
            _model: &'a str,
            _prompts: &'a PromptTable,
        ) -> InvokeFuture<'a> {
            Box::pin(async { Ok(None) })
        }
    }

    fn manager() -> AiManager {
        let prompts: PromptTable = [
            ("person".to_string(), Prompt::text("Describe {name}")),
            ("haiku".to_string(), Prompt::text("Write a haiku")),
        ]
        .into_iter()
        .collect();
        let schemas = SchemaStore::new();
        schemas
            .add(
                "person",
                json!({
                    "type": "object",
                    "required": ["name", "age"],
                    "properties": {
                        "name": {"type": "string"},
                        "age": {"type": "integer"}
                    }
                }),
            )
            .expect("valid schema");
        schemas.add_example("orphan", "key: value");

        AiManager::with_parts(
            ManagerSettings::default(),
            prompts,
            schemas,
            Arc::new(SilentInvoker),
        )
    }

    #[test]
    fn schema_prompts_intersects_prompts_and_schemas() {
        let manager = manager();
        assert_eq!(manager.schema_prompts(), vec!["person".to_string()]);
        assert_eq!(
            manager.available_schemas(),
            vec!["orphan".to_string(), "person".to_string()]
        );
        assert!(manager.has_schema_for_prompt("person"));
        assert!(!manager.has_schema_for_prompt("haiku"));
    }

    #[test]
    fn validate_response_checks_parse_and_schema() {
        let manager = manager();

        let ok = manager.validate_response_for_prompt(
            "Here is the JSON:\n```json\n{\"name\": \"Ada\", \"age\": 36}\n```",
            "person",
        );
        assert!(ok.valid, "unexpected errors: {:?}", ok.errors);

        let mismatch = manager.validate_response_for_prompt("name: Ada\nage: old", "person");
        assert!(!mismatch.valid);
        assert!(mismatch.errors.iter().any(|issue| issue.path == "/age"));

        let unparsable = manager.validate_response_for_prompt("just words", "person");
        assert!(!unparsable.valid);
        assert!(unparsable.data.is_none());
    }

    #[tokio::test]
    async fn media_calls_without_replicate_fail_fast() {
        let manager = manager();
        let request = manager.image_request("a lighthouse");
        assert!(request.folder.ends_with("images"));

        let err = manager
            .generate_image(&request)
            .await
            .expect_err("replicate is not configured");
        assert!(matches!(err, AiManagerError::ReplicateNotConfigured));

        let err = manager
            .generate_speech("hello", None, None, None)
            .await
            .expect_err("openai is not configured");
        assert!(matches!(err, AiManagerError::OpenAiNotConfigured));
    }

    #[test]
    fn settings_pick_up_custom_template() {
        let mut config = AiManagerConfig {
            prompt_folder: "prompts".into(),
            schema_folder: "schemas".into(),
            output_dir: "out".into(),
            chat_model: "m".to_string(),
            tts_model: "t".to_string(),
            tts_voice: "v".to_string(),
            whisper_model: "w".to_string(),
            max_validation_retries: 1,
            validation_retry_delay_ms: 25,
            schema_prompt_template: None,
            openai: crate::config::OpenAiConfig::new("key"),
            replicate: None,
        };
        let settings = ManagerSettings::from_config(&config);
        assert_eq!(settings.validation_retry_delay.as_millis(), 25);
        assert_eq!(settings.schema_prompt_template.render("a", "b").lines().next(), Some("a"));

        config.schema_prompt_template = Some("{schema_example}|{base_prompt}".to_string());
        let settings = ManagerSettings::from_config(&config);
        assert_eq!(settings.schema_prompt_template.render("a", "b"), "b|a");
    }
}
