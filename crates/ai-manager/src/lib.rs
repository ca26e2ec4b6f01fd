//! Convenience layer over generative-AI HTTP APIs.
//!
//! The centerpiece is [`llm::validated`]: a retry loop that turns free-form
//! model text into data conforming to a registered schema.

pub mod config;
mod config_env;
pub mod llm;
pub mod manager;
pub mod media;
pub mod prompts;

pub use config::{
    AiManagerConfig, ConfigError, ContentConfig, ImageDefaults, OpenAiConfig, ReplicateConfig,
};
pub use manager::{AiManager, AiManagerError, ManagerSettings};
pub use prompts::{Prompt, PromptTable, RenderedPrompt};
