//! Retry loop that coerces free-form model output into schema-conformant data.
//!
//! One call runs: schema lookup, prompt lookup and placeholder check, a single
//! prompt augmentation, then `max_retries + 1` sequential attempts. Each
//! attempt invokes the model, sanitizes and parses the reply, and checks it
//! against the registered schema. The first valid attempt wins.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use super::chat::{ChatError, ModelInvoker};
use super::formatter::{PromptData, escape_braces, missing_keys};
use super::parser::{ValidationResult, validate_structured_response};
use super::schema_store::SchemaStore;
use crate::prompts::PromptTable;

const BASE_PROMPT_TOKEN: &str = "{base_prompt}";
const SCHEMA_EXAMPLE_TOKEN: &str = "{schema_example}";

const DEFAULT_SCHEMA_PROMPT_TEMPLATE: &str = "{base_prompt}

Please respond with structured data in the following format:

{schema_example}

Return only the structured data without any additional text or explanations.";

/// Combines a prompt's user template with schema text.
#[derive(Debug, Clone)]
pub struct SchemaPromptTemplate {
    template: String,
}

impl Default for SchemaPromptTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_SCHEMA_PROMPT_TEMPLATE.to_string(),
        }
    }
}

impl SchemaPromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Schema text is brace-escaped so the later placeholder pass reproduces it
    /// verbatim; placeholders inside `base_prompt` stay live. Substituted text
    /// is never scanned for tokens again.
    pub fn render(&self, base_prompt: &str, schema_text: &str) -> String {
        let schema_text = escape_braces(schema_text);
        self.template
            .split(BASE_PROMPT_TOKEN)
            .map(|segment| segment.replace(SCHEMA_EXAMPLE_TOKEN, &schema_text))
            .collect::<Vec<_>>()
            .join(base_prompt)
    }
}

/// Why a single attempt did not produce valid data.
#[derive(Debug, Clone)]
pub enum AttemptFailure {
    EmptyResponse,
    ParseFailure(ValidationResult),
    SchemaMismatch(ValidationResult),
    InvocationFault(String),
}

impl AttemptFailure {
    pub fn validation_result(&self) -> Option<&ValidationResult> {
        match self {
            Self::ParseFailure(result) | Self::SchemaMismatch(result) => Some(result),
            Self::EmptyResponse | Self::InvocationFault(_) => None,
        }
    }

    pub fn into_validation_result(self) -> Option<ValidationResult> {
        match self {
            Self::ParseFailure(result) | Self::SchemaMismatch(result) => Some(result),
            Self::EmptyResponse | Self::InvocationFault(_) => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::EmptyResponse => "empty response".to_string(),
            Self::ParseFailure(result) => format!("parse failure: {}", result.error_summary()),
            Self::SchemaMismatch(result) => format!("schema mismatch: {}", result.error_summary()),
            Self::InvocationFault(message) => format!("invocation fault: {message}"),
        }
    }
}

/// Terminal record returned once every allowed attempt has failed.
#[derive(Debug, Clone)]
pub struct ExhaustedRetries {
    pub prompt_name: String,
    pub attempts: u32,
    pub last_response: Option<String>,
    pub last_failure: AttemptFailure,
}

impl ExhaustedRetries {
    pub fn error_message(&self) -> String {
        match &self.last_failure {
            AttemptFailure::InvocationFault(message) => {
                format!("Exception after all retries: {message}")
            }
            _ => "Validation failed after all retries".to_string(),
        }
    }

    pub fn validation_result(&self) -> Option<&ValidationResult> {
        self.last_failure.validation_result()
    }
}

#[derive(Debug, Error)]
pub enum ValidatedChatError {
    #[error("No schema available for prompt '{prompt_name}'")]
    NoSchema { prompt_name: String },
    #[error("Prompt '{prompt_name}' not found")]
    PromptNotFound { prompt_name: String },
    #[error("missing required data keys for prompt '{prompt_name}': {missing:?}")]
    MissingDataKeys {
        prompt_name: String,
        missing: Vec<String>,
    },
    #[error("{} for prompt '{}' ({} attempts)", .0.error_message(), .0.prompt_name, .0.attempts)]
    ExhaustedRetries(Box<ExhaustedRetries>),
    #[error("Unexpected failure in validation loop for prompt '{prompt_name}'")]
    Unexpected { prompt_name: String },
}

impl ValidatedChatError {
    pub fn prompt_name(&self) -> &str {
        match self {
            Self::NoSchema { prompt_name }
            | Self::PromptNotFound { prompt_name }
            | Self::MissingDataKeys { prompt_name, .. }
            | Self::Unexpected { prompt_name } => prompt_name,
            Self::ExhaustedRetries(exhausted) => &exhausted.prompt_name,
        }
    }
}

/// Outcome of one loop pass.
#[derive(Debug)]
enum LoopStep {
    Success(Value),
    Retry(AttemptFailure),
    Terminal(ValidatedChatError),
}

pub struct ValidationOrchestrator<'a> {
    invoker: &'a dyn ModelInvoker,
    prompts: &'a PromptTable,
    schemas: &'a SchemaStore,
    template: SchemaPromptTemplate,
    retry_delay: Duration,
}

impl<'a> ValidationOrchestrator<'a> {
    pub fn new(
        invoker: &'a dyn ModelInvoker,
        prompts: &'a PromptTable,
        schemas: &'a SchemaStore,
    ) -> Self {
        Self {
            invoker,
            prompts,
            schemas,
            template: SchemaPromptTemplate::default(),
            retry_delay: Duration::ZERO,
        }
    }

    pub fn with_template(mut self, template: SchemaPromptTemplate) -> Self {
        self.template = template;
        self
    }

    /// Pause between a failed attempt and the next one.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Runs up to `max_retries + 1` attempts and returns the first valid data.
    pub async fn generate_validated(
        &self,
        prompt_name: &str,
        data: &PromptData,
        model: &str,
        max_retries: u32,
    ) -> Result<Value, ValidatedChatError> {
        let Some(schema) = self.schemas.get(prompt_name) else {
            error!(prompt_name, "validation requested but no schema found");
            return Err(ValidatedChatError::NoSchema {
                prompt_name: prompt_name.to_string(),
            });
        };

        let Some(prompt) = self.prompts.get(prompt_name) else {
            return Err(ValidatedChatError::PromptNotFound {
                prompt_name: prompt_name.to_string(),
            });
        };

        let base_user_prompt = match prompt.user_template() {
            Some(template) => template,
            None => {
                warn!(prompt_name, "prompt has no user part; sending schema instructions only");
                ""
            }
        };
        let augmented = self.template.render(base_user_prompt, &schema.prompt_text());
        let missing = missing_keys(&augmented, data);
        if !missing.is_empty() {
            error!(prompt_name, ?missing, "missing required data keys for formatting");
            return Err(ValidatedChatError::MissingDataKeys {
                prompt_name: prompt_name.to_string(),
                missing,
            });
        }

        let augmented_prompts: PromptTable =
            [(prompt_name.to_string(), prompt.with_user_template(augmented))]
                .into_iter()
                .collect();

        for attempt in 0..=max_retries {
            let attempt_number = attempt + 1;
            let (response, step) = self
                .run_attempt(prompt_name, data, model, &augmented_prompts)
                .await;

            match step {
                LoopStep::Success(value) => {
                    info!(prompt_name, attempt = attempt_number, "validation successful");
                    return Ok(value);
                }
                LoopStep::Terminal(err) => return Err(err),
                LoopStep::Retry(failure) if attempt == max_retries => {
                    error!(
                        prompt_name,
                        attempt = attempt_number,
                        "validation failed on final attempt: {}",
                        failure.describe()
                    );
                    return Err(ValidatedChatError::ExhaustedRetries(Box::new(
                        ExhaustedRetries {
                            prompt_name: prompt_name.to_string(),
                            attempts: attempt_number,
                            last_response: response,
                            last_failure: failure,
                        },
                    )));
                }
                LoopStep::Retry(failure) => {
                    warn!(
                        prompt_name,
                        attempt = attempt_number,
                        "validation attempt failed: {}",
                        failure.describe()
                    );
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(ValidatedChatError::Unexpected {
            prompt_name: prompt_name.to_string(),
        })
    }

    async fn run_attempt(
        &self,
        prompt_name: &str,
        data: &PromptData,
        model: &str,
        augmented_prompts: &PromptTable,
    ) -> (Option<String>, LoopStep) {
        let response = match self
            .invoker
            .invoke(prompt_name, data, model, augmented_prompts)
            .await
        {
            Ok(Some(response)) if !response.trim().is_empty() => response,
            Ok(_) => return (None, LoopStep::Retry(AttemptFailure::EmptyResponse)),
            Err(ChatError::MissingDataKeys {
                prompt_name,
                missing,
            }) => {
                return (
                    None,
                    LoopStep::Terminal(ValidatedChatError::MissingDataKeys {
                        prompt_name,
                        missing,
                    }),
                );
            }
            Err(err) => {
                return (
                    None,
                    LoopStep::Retry(AttemptFailure::InvocationFault(err.to_string())),
                );
            }
        };

        let step = match check_response(&response, prompt_name, self.schemas) {
            Ok(ValidationResult {
                data: Some(value), ..
            }) => LoopStep::Success(value),
            Ok(result) => LoopStep::Retry(AttemptFailure::ParseFailure(result)),
            Err(failure) => LoopStep::Retry(failure),
        };
        (Some(response), step)
    }
}

/// Sanitizes and parses `raw`, then checks it against the JSON Schema
/// registered for `prompt_name`. Exemplar schemas and unknown names only
/// require the text to parse.
pub fn check_response(
    raw: &str,
    prompt_name: &str,
    schemas: &SchemaStore,
) -> Result<ValidationResult, AttemptFailure> {
    let parsed = validate_structured_response(raw);
    let Some(data) = parsed.data.as_ref().filter(|_| parsed.valid) else {
        return Err(AttemptFailure::ParseFailure(parsed));
    };
    if !schemas
        .get(prompt_name)
        .is_some_and(|schema| schema.is_structured())
    {
        return Ok(parsed);
    }

    let checked = schemas.validate(data, prompt_name);
    if checked.valid {
        return Ok(parsed);
    }
    Err(AttemptFailure::SchemaMismatch(ValidationResult {
        valid: false,
        errors: checked.errors,
        ..parsed
    }))
}
