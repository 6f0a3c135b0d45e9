//! Configuration module for Samtale.

mod prompts;
mod settings;

pub use prompts::{Prompts, TRANSCRIPT_MARKER};
pub use settings::{
    AudioConfig, Config, LlmConfig, ServerConfig, StoreConfig, TranscriberConfig,
};
