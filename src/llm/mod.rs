//! LLM invocation abstraction for Samtale.

mod chat;

pub use chat::ChatInvoker;

use crate::error::Result;
use async_trait::async_trait;

/// Trait for prompt-to-completion services with per-call model selection.
#[async_trait]
pub trait LlmInvoker: Send + Sync {
    /// Send a single-prompt completion request and return the response text.
    async fn invoke(&self, model: &str, prompt: &str) -> Result<String>;
}
