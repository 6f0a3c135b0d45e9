//! Chat-completion invoker over an OpenAI-compatible endpoint.
//!
//! Ollama and llama.cpp both expose this surface, so one client covers the
//! local-model deployments the server targets. There is no forced per-call
//! timeout (models can be slow); an optional outer deadline comes from the
//! file configuration.

use super::LlmInvoker;
use crate::error::{Result, SamtaleError};
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument};

/// LLM invoker backed by a chat-completion API.
pub struct ChatInvoker {
    client: async_openai::Client<OpenAIConfig>,
    deadline: Option<Duration>,
}

impl ChatInvoker {
    /// Create an invoker against the given API base. A `deadline_seconds`
    /// of zero disables the outer deadline.
    pub fn new(api_base: &str, deadline_seconds: u64) -> Self {
        let http_client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");

        let config = OpenAIConfig::new().with_api_base(api_base);
        let client = async_openai::Client::with_config(config).with_http_client(http_client);

        Self {
            client,
            deadline: (deadline_seconds > 0).then(|| Duration::from_secs(deadline_seconds)),
        }
    }

    async fn invoke_inner(&self, model: &str, prompt: &str) -> Result<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(|e| SamtaleError::Llm(e.to_string()))?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages)
            .build()
            .map_err(|e| SamtaleError::Llm(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| SamtaleError::Llm(format!("Chat completion failed: {}", e)))?;

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| SamtaleError::Llm("Empty response from LLM".to_string()))?
            .clone();

        debug!("LLM returned {} characters", text.len());
        Ok(text)
    }
}

#[async_trait]
impl LlmInvoker for ChatInvoker {
    #[instrument(skip(self, prompt), fields(model = %model, prompt_len = prompt.len()))]
    async fn invoke(&self, model: &str, prompt: &str) -> Result<String> {
        match self.deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.invoke_inner(model, prompt)).await {
                    Ok(result) => result,
                    Err(_) => Err(SamtaleError::Llm(format!(
                        "deadline of {}s exceeded",
                        deadline.as_secs()
                    ))),
                }
            }
            None => self.invoke_inner(model, prompt).await,
        }
    }
}
