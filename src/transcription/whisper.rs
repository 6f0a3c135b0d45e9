//! Whisper-compatible API transcription implementation.

use super::{Transcriber, TranscriptionOutcome};
use crate::error::{Result, SamtaleError};
use async_openai::config::OpenAIConfig;
use async_openai::types::{AudioResponseFormat, CreateTranscriptionRequestArgs};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument};

/// Transcriber backed by an OpenAI-compatible audio transcription endpoint.
pub struct WhisperApiTranscriber {
    client: async_openai::Client<OpenAIConfig>,
    timeout_seconds: u64,
}

impl WhisperApiTranscriber {
    /// Create a transcriber against the given API base, with a soft
    /// per-call timeout.
    pub fn new(api_base: &str, timeout_seconds: u64) -> Self {
        let http_client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");

        let config = OpenAIConfig::new().with_api_base(api_base);
        let client = async_openai::Client::with_config(config).with_http_client(http_client);

        Self {
            client,
            timeout_seconds,
        }
    }

    async fn transcribe_inner(
        &self,
        audio: Vec<u8>,
        language: Option<&str>,
        model: &str,
    ) -> Result<TranscriptionOutcome> {
        let mut request_builder = CreateTranscriptionRequestArgs::default();
        request_builder
            .file(async_openai::types::AudioInput::from_vec_u8(
                "frame.wav".to_string(),
                audio,
            ))
            .model(model)
            .response_format(AudioResponseFormat::VerboseJson);

        if let Some(lang) = language {
            request_builder.language(lang);
        }

        let request = request_builder
            .build()
            .map_err(|e| SamtaleError::Transcription(format!("Failed to build request: {}", e)))?;

        let response = self
            .client
            .audio()
            .transcribe_verbose_json(request)
            .await
            .map_err(|e| SamtaleError::Transcription(format!("Whisper API error: {}", e)))?;

        debug!("Transcribed {} characters", response.text.len());

        Ok(TranscriptionOutcome {
            text: response.text.trim().to_string(),
            language: Some(response.language),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Transcriber for WhisperApiTranscriber {
    #[instrument(skip(self, audio), fields(bytes = audio.len()))]
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        language: Option<&str>,
        model: &str,
    ) -> Result<TranscriptionOutcome> {
        // "auto" delegates language detection to the engine
        let language = language.filter(|l| *l != "auto");

        let deadline = Duration::from_secs(self.timeout_seconds);
        match tokio::time::timeout(deadline, self.transcribe_inner(audio, language, model)).await {
            Ok(result) => result,
            Err(_) => Err(SamtaleError::TranscriberTimeout(self.timeout_seconds)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_emptiness() {
        let outcome = TranscriptionOutcome {
            text: "  \n ".to_string(),
            language: None,
            model: "base".to_string(),
        };
        assert!(outcome.is_empty());

        let outcome = TranscriptionOutcome {
            text: "Hello world".to_string(),
            language: Some("en".to_string()),
            model: "base".to_string(),
        };
        assert!(!outcome.is_empty());
    }
}
