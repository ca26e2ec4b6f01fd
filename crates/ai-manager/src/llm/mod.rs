pub mod chat;
pub mod formatter;
pub mod gateway;
pub mod openai;
pub mod parser;
pub mod sanitizer;
pub mod schema_store;
pub mod validated;

pub use chat::{ChatError, GatewayInvoker, InvokeFuture, ModelInvoker, build_messages, chat};
pub use formatter::{FormatError, PromptData, format_prompt, missing_keys, placeholders};
pub use gateway::{
    ChatCompletion, ChatCompletionRequest, ChatGateway, ChatGatewayFuture, ChatMessage, ChatRole,
    GatewayError, TokenUsage,
};
pub use openai::{AudioSource, OpenAiClient, SpeechRequest};
pub use parser::{
    ResponseFormat, ValidationIssue, ValidationResult, parse_structured,
    validate_structured_response,
};
pub use sanitizer::sanitize_response;
pub use schema_store::{SchemaDocument, SchemaStore, SchemaStoreError, StructuredSchema};
pub use validated::{
    AttemptFailure, ExhaustedRetries, SchemaPromptTemplate, ValidatedChatError,
    ValidationOrchestrator,
};
