//! Persistence abstraction for Samtale.
//!
//! Provides a trait-based interface over the session store so pipelines and
//! transports never touch SQL directly.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A logical conversation with its own transcript history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session id.
    pub id: String,
    /// Optional human-readable name.
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
}

/// One transcription result belonging to a session.
///
/// Text and language are immutable once created; only `processed_at` is ever
/// updated, when both LLM pipelines have considered this transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub id: i64,
    pub session_id: String,
    pub text: String,
    pub language: Option<String>,
    /// Transcriber model that produced the text.
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// An LLM summary result for a session. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: i64,
    pub session_id: String,
    /// The composed prompt sent to the LLM.
    pub prompt: String,
    /// The LLM response text.
    pub response: String,
    pub model: String,
    /// Wall time of the LLM call, in seconds.
    pub processing_time: f64,
    pub created_at: DateTime<Utc>,
}

/// A node in a mind map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MindMapNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// A labeled edge between two mind-map nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MindMapEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// A persisted concept graph derived from a session. Append-only.
///
/// Invariant: every edge endpoint references a node id in the same map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MindMap {
    pub id: i64,
    pub session_id: String,
    pub nodes: Vec<MindMapNode>,
    pub edges: Vec<MindMapEdge>,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// The persisted settings row (process-wide singleton).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSettings {
    pub whisper_language: String,
    pub whisper_model: String,
    pub summary_model: String,
    pub mind_map_model: String,
    pub summary_prompt: String,
    pub mind_map_prompt: String,
    /// Nominal duration of one client audio frame, in milliseconds.
    pub frame_length_ms: u32,
    /// Frames accumulated into one transcription unit.
    pub frames_per_batch: u32,
    pub active_session_id: Option<String>,
}

impl Default for StoredSettings {
    fn default() -> Self {
        Self {
            whisper_language: "auto".to_string(),
            whisper_model: "base".to_string(),
            summary_model: "llama3.2:latest".to_string(),
            mind_map_model: "llama3.2:latest".to_string(),
            summary_prompt: crate::config::Prompts::default().summary,
            mind_map_prompt: crate::config::Prompts::default().mind_map,
            frame_length_ms: 500,
            frames_per_batch: 10,
            active_session_id: None,
        }
    }
}

/// Field-wise update for the persisted settings row. Absent fields keep
/// their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub whisper_language: Option<String>,
    pub whisper_model: Option<String>,
    pub summary_model: Option<String>,
    pub mind_map_model: Option<String>,
    pub summary_prompt: Option<String>,
    pub mind_map_prompt: Option<String>,
    pub frame_length_ms: Option<u32>,
    pub frames_per_batch: Option<u32>,
    pub active_session_id: Option<Option<String>>,
}

/// Trait for the session store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a session with the given id, failing silently into a fetch if
    /// it already exists. Reactivates an existing session.
    async fn ensure_session(&self, session_id: &str) -> Result<Session>;

    /// Create a session with an optional name; errors if the id exists.
    async fn create_session(&self, session_id: &str, name: Option<&str>) -> Result<Session>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// List sessions, most recently active first.
    async fn list_sessions(&self) -> Result<Vec<Session>>;

    /// Rename a session. `SessionNotFound` if the id is unknown.
    async fn rename_session(&self, session_id: &str, name: &str) -> Result<Session>;

    async fn set_session_active(&self, session_id: &str, active: bool) -> Result<()>;

    /// Bump a session's last-activity timestamp.
    async fn touch_session(&self, session_id: &str) -> Result<()>;

    /// Delete a session and all child rows. `SessionNotFound` if unknown.
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// Delete every session (and, via cascade, all derived rows).
    async fn clear_sessions(&self) -> Result<usize>;

    async fn insert_transcript(
        &self,
        session_id: &str,
        text: &str,
        language: Option<&str>,
        model: Option<&str>,
    ) -> Result<Transcript>;

    /// All transcripts for a session, ordered by creation (ascending id).
    async fn list_transcripts(&self, session_id: &str) -> Result<Vec<Transcript>>;

    /// Stamp `processed_at` on unprocessed transcripts with id <= `up_to_id`.
    async fn mark_transcripts_processed(&self, session_id: &str, up_to_id: i64) -> Result<usize>;

    async fn insert_analysis(
        &self,
        session_id: &str,
        prompt: &str,
        response: &str,
        model: &str,
        processing_time: f64,
    ) -> Result<Analysis>;

    /// Analyses for a session, newest first.
    async fn list_analyses(&self, session_id: &str) -> Result<Vec<Analysis>>;

    async fn insert_mind_map(
        &self,
        session_id: &str,
        nodes: &[MindMapNode],
        edges: &[MindMapEdge],
        model: &str,
    ) -> Result<MindMap>;

    /// Mind maps for a session, newest first.
    async fn list_mind_maps(&self, session_id: &str) -> Result<Vec<MindMap>>;

    /// Load the settings singleton, seeding defaults on first access.
    async fn load_settings(&self) -> Result<StoredSettings>;

    /// Apply a field-wise update to the settings singleton.
    async fn update_settings(&self, update: &SettingsUpdate) -> Result<StoredSettings>;
}
