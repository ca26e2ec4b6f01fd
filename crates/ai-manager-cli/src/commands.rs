use std::fs;
use std::path::Path;

use ai_manager::llm::openai::AudioSource;
use ai_manager::llm::schema_store::SchemaStore;
use ai_manager::llm::validated::check_response;
use ai_manager::media::{self, MusicRequest};
use ai_manager::{AiManager, AiManagerConfig, ContentConfig, PromptTable};
use serde::Serialize;
use tracing::info;

use crate::cli::{
    ChatArgs, CliError, Command, ImageArgs, MusicArgs, OutputArgs, SpeakArgs, VideoArgs,
    parse_data,
};

pub async fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::Schemas => list_schemas(),
        Command::Check { prompt, file } => check_saved_response(&prompt, &file),
        Command::Chat(args) => run_chat(&connect()?, args).await,
        Command::Speak(args) => run_speak(&connect()?, args).await,
        Command::Transcribe { file } => {
            let text = connect()?
                .transcribe_audio(AudioSource::Path(file))
                .await?;
            println!("{text}");
            Ok(())
        }
        Command::Image(args) => run_image(&connect()?, args).await,
        Command::Video(args) => run_video(&connect()?, args).await,
        Command::Music(args) => run_music(&connect()?, args).await,
    }
}

fn connect() -> Result<AiManager, CliError> {
    let config = AiManagerConfig::from_env()?;
    Ok(AiManager::from_config(config)?)
}

fn load_schemas(content: &ContentConfig) -> Result<SchemaStore, CliError> {
    let schemas = SchemaStore::new();
    schemas.load(&content.schema_folder)?;
    Ok(schemas)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn list_schemas() -> Result<(), CliError> {
    let content = ContentConfig::from_env();
    let prompts = PromptTable::load_dir(&content.prompt_folder);
    let schemas = load_schemas(&content)?;

    for name in schemas.names() {
        let kind = match schemas.get(&name) {
            Some(schema) if schema.is_structured() => "json-schema",
            _ => "example",
        };
        let marker = if prompts.contains(&name) { "" } else { " (no prompt)" };
        println!("{name}\t{kind}{marker}");
    }
    Ok(())
}

fn check_saved_response(prompt: &str, file: &Path) -> Result<(), CliError> {
    let raw = fs::read_to_string(file).map_err(|source| CliError::Io {
        path: file.display().to_string(),
        source,
    })?;
    let schemas = load_schemas(&ContentConfig::from_env())?;

    match check_response(&raw, prompt, &schemas) {
        Ok(result) => print_json(&result),
        Err(failure) => {
            if let Some(result) = failure.validation_result() {
                print_json(result)?;
            }
            Err(CliError::InvalidResponse(prompt.to_string()))
        }
    }
}

async fn run_chat(manager: &AiManager, args: ChatArgs) -> Result<(), CliError> {
    let data = match (&args.data, &args.data_file) {
        (_, Some(path)) => {
            let raw = fs::read_to_string(path).map_err(|source| CliError::Io {
                path: path.display().to_string(),
                source,
            })?;
            parse_data(Some(&raw))?
        }
        (data, None) => parse_data(data.as_deref())?,
    };
    let model = args.model.as_deref();

    if args.validate {
        let max_retries = args
            .max_retries
            .unwrap_or(manager.settings().max_validation_retries);
        let value = manager
            .chat_validated_with_retries(&args.prompt, &data, model, max_retries)
            .await?;
        return print_json(&value);
    }

    let response = manager
        .chat(&args.prompt, &data, model)
        .await
        .ok_or_else(|| CliError::NoResponse(args.prompt.clone()))?;
    println!("{response}");
    Ok(())
}

async fn run_speak(manager: &AiManager, args: SpeakArgs) -> Result<(), CliError> {
    let path = manager
        .generate_speech(
            &args.text,
            args.voice.as_deref(),
            args.model.as_deref(),
            args.output.as_deref(),
        )
        .await?;
    println!("{}", path.display());
    Ok(())
}

fn apply_output(output: OutputArgs, file_name: &mut String, folder: &mut std::path::PathBuf) {
    if let Some(name) = output.name {
        *file_name = name;
    }
    if let Some(custom) = output.folder {
        *folder = custom;
    }
}

async fn run_image(manager: &AiManager, args: ImageArgs) -> Result<(), CliError> {
    let mut request = manager.image_request(args.prompt);
    apply_output(args.output, &mut request.file_name, &mut request.folder);
    request.file_type = args.file_type;
    request.width = args.width;
    request.height = args.height;

    let path = manager.generate_image(&request).await?;
    println!("{}", path.display());
    Ok(())
}

async fn run_video(manager: &AiManager, args: VideoArgs) -> Result<(), CliError> {
    let mut request = manager.video_request(args.prompt);
    apply_output(args.output, &mut request.file_name, &mut request.folder);
    request.duration = args.duration;
    request.aspect_ratio = args.aspect_ratio;

    let path = match args.image.as_deref() {
        Some(image) => manager.generate_video_from_image(image, &request).await?,
        None => manager.generate_video(&request).await?,
    };
    println!("{}", path.display());
    Ok(())
}

async fn run_music(manager: &AiManager, args: MusicArgs) -> Result<(), CliError> {
    let base_name = args
        .output
        .name
        .clone()
        .unwrap_or_else(|| media::default_file_name("music"));
    let folder = args.output.folder.as_deref();

    let files = if args.chain {
        manager
            .generate_music_chain(&args.prompts, folder, &base_name, args.duration)
            .await?
    } else if !args.variation.is_empty() {
        let base_prompt = args.prompts.join(", ");
        manager
            .generate_music_variations(&base_prompt, &args.variation, folder, &base_name, args.duration)
            .await?
    } else {
        let mut request: MusicRequest = manager.music_request(args.prompts.join(", "));
        request.file_name = base_name;
        if let Some(folder) = folder {
            request.folder = folder.to_path_buf();
        }
        request.duration = args.duration;
        request.output_format = args.format;
        request.continuation_audio = args.continue_from;
        vec![manager.generate_music(&request).await?]
    };

    info!(count = files.len(), "music generation finished");
    for path in files {
        println!("{}", path.display());
    }
    Ok(())
}
