//! Speech-to-text abstraction for Samtale.

mod whisper;

pub use whisper::WhisperApiTranscriber;

use crate::error::Result;
use async_trait::async_trait;

/// Result of transcribing one audio unit.
#[derive(Debug, Clone)]
pub struct TranscriptionOutcome {
    /// Transcribed text. May be empty when the unit contained no speech.
    pub text: String,
    /// Detected (or requested) language.
    pub language: Option<String>,
    /// Model that produced the text.
    pub model: String,
}

impl TranscriptionOutcome {
    /// Whether the model returned only whitespace. Empty outcomes are
    /// successes but do not fire downstream pipelines.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Trait for transcription services.
///
/// `language` of `None` (or the `"auto"` setting) lets the engine detect the
/// spoken language.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a complete WAV unit.
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        language: Option<&str>,
        model: &str,
    ) -> Result<TranscriptionOutcome>;
}
