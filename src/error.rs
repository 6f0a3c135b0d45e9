//! Error types for Samtale.

use thiserror::Error;

/// Library-level error type for Samtale operations.
#[derive(Error, Debug)]
pub enum SamtaleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid audio frame: {0}")]
    InvalidFrame(String),

    #[error("Intake queue overflow for session {0}")]
    Overflow(String),

    #[error("Transcription timed out after {0} seconds")]
    TranscriberTimeout(u64),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("No transcripts available for session {0}")]
    NoContent(String),

    #[error("LLM call failed: {0}")]
    Llm(String),

    #[error("Invalid mind map response: {reason}")]
    InvalidMindMap { reason: String, raw: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for Samtale operations.
pub type Result<T> = std::result::Result<T, SamtaleError>;
