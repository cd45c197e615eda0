//! Model backend for qa-forge.
//!
//! Each GPU device is served by its own OpenAI-compatible inference server.
//! [`LocalServerLoader`] checks that a device's server is up and serves the
//! requested model, then hands the pool a [`LocalServerGenerator`] for it.
//!
//! ```ignore
//! use qa_forge::llm::LocalServerLoader;
//! use qa_forge::pipeline::AppConfig;
//!
//! let config = AppConfig::from_file("config.json")?;
//! let loader = LocalServerLoader::from_config(&config);
//! ```

pub mod client;
pub mod local;

pub use client::{
    ChatClient, Choice, ChoiceMessage, GenerationRequest, GenerationResponse, LlmProvider,
    Message, Usage,
};
pub use local::{
    build_user_prompt, parse_qa_reply, LocalServerGenerator, LocalServerLoader,
    SamplingSettings, QA_SYSTEM_PROMPT,
};
