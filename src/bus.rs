//! Per-session event hub.
//!
//! Pipelines and workers publish typed events; the websocket transport
//! subscribes per session and forwards them to clients. Publishing to a
//! session with no subscribers drops the event, which is exactly the
//! disconnect semantics the pipelines rely on: work runs to completion and
//! persists, delivery is simply skipped.

use crate::processing::OperationKind;
use crate::store::{MindMapEdge, MindMapNode};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// Live transcription outcome for one audio unit.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionResult {
    pub success: bool,
    pub text: String,
    pub language: Option<String>,
    pub model: Option<String>,
    pub session_id: String,
    pub transcript_id: Option<i64>,
}

/// Microphone level indication for one accepted frame.
#[derive(Debug, Clone, Serialize)]
pub struct AudioLevel {
    #[serde(rename = "audioLevel")]
    pub audio_level: u8,
    pub session_id: String,
}

/// Completed summary pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionAnalysis {
    pub session_id: String,
    pub analysis_id: i64,
    pub processing_time: f64,
    pub analysis: String,
}

/// Completed mind-map pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct MindMapResult {
    pub session_id: String,
    pub mind_map_id: i64,
    pub nodes: Vec<MindMapNode>,
    pub edges: Vec<MindMapEdge>,
}

/// Pipeline scheduling notice (e.g. a skipped run while one is in flight).
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStatus {
    pub session_id: String,
    pub operation: OperationKind,
    pub status: String,
}

/// Connection/stream lifecycle notice.
#[derive(Debug, Clone, Serialize)]
pub struct StatusNotice {
    pub message: String,
    pub session_id: String,
    pub status: String,
}

/// Recoverable fault surfaced to the client.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorNotice {
    pub error: String,
    /// Raw model output, attached when a mind-map response was unusable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl ErrorNotice {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            raw: None,
        }
    }
}

/// Typed event published on a session's channel. The serde tag/content
/// layout matches the wire envelope's `type`/`data` fields.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    TranscriptionResult(TranscriptionResult),
    AudioLevel(AudioLevel),
    SessionAnalysis(SessionAnalysis),
    MindMapResult(MindMapResult),
    ProcessingStatus(ProcessingStatus),
    Status(StatusNotice),
    Error(ErrorNotice),
}

/// Per-session broadcast hub. Delivery order per session is publication
/// order; cross-session ordering is unspecified.
pub struct SessionBus {
    channels: Mutex<HashMap<String, broadcast::Sender<SessionEvent>>>,
}

impl SessionBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event to a session. A session with no subscribers drops
    /// the event silently.
    pub fn publish(&self, session_id: &str, event: SessionEvent) {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.get(session_id) {
            // send only fails when every receiver is gone
            let _ = sender.send(event);
        } else {
            debug!("Dropped event for session {} (no subscribers)", session_id);
        }
    }

    /// Subscribe to a session's event stream.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop a session's channel if nobody is listening anymore. Called by
    /// the transport after a disconnect releases its receiver.
    pub fn prune(&self, session_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.get(session_id) {
            if sender.receiver_count() == 0 {
                channels.remove(session_id);
                debug!("Pruned event channel for session {}", session_id);
            }
        }
    }

    /// Number of live subscribers for a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(session_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}
