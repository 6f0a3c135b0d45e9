//! Effective-settings resolution.
//!
//! Pipelines never read the settings row directly; they ask the resolver for
//! an immutable [`EffectiveSettings`] snapshot at job start. A process-wide
//! [`TemporaryOverride`] patches the persisted row without touching the
//! store, and is shared by every resolution site.

use crate::error::Result;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Model sentinel meaning "this pipeline is disabled".
pub const MODEL_DISABLED: &str = "none";

/// Immutable settings snapshot used by one pipeline or transcription job.
///
/// Resolved exactly once at job start; mid-run changes to the store or the
/// override never affect an in-flight job.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveSettings {
    pub whisper_language: String,
    pub whisper_model: String,
    pub summary_model: String,
    pub mind_map_model: String,
    pub summary_prompt: String,
    pub mind_map_prompt: String,
    pub frame_length_ms: u32,
    pub frames_per_batch: u32,
}

impl EffectiveSettings {
    pub fn summary_enabled(&self) -> bool {
        self.summary_model != MODEL_DISABLED
    }

    pub fn mind_map_enabled(&self) -> bool {
        self.mind_map_model != MODEL_DISABLED
    }
}

/// A shallow patch over the persisted settings. Present fields win; absent
/// fields fall through to the store. Cleared on process restart by nature.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TemporaryOverride {
    pub summary_model: Option<String>,
    pub mind_map_model: Option<String>,
    pub summary_prompt: Option<String>,
    pub mind_map_prompt: Option<String>,
}

impl TemporaryOverride {
    pub fn is_empty(&self) -> bool {
        self.summary_model.is_none()
            && self.mind_map_model.is_none()
            && self.summary_prompt.is_none()
            && self.mind_map_prompt.is_none()
    }
}

/// Resolves effective settings from the store plus the temporary override.
///
/// The override value is copy-on-write: writers swap in a fresh `Arc` under
/// the lock, readers clone the current `Arc` and work on an immutable value.
pub struct SettingsResolver {
    store: Arc<dyn Store>,
    current_override: RwLock<Arc<TemporaryOverride>>,
}

impl SettingsResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            current_override: RwLock::new(Arc::new(TemporaryOverride::default())),
        }
    }

    /// Resolve the effective settings snapshot.
    pub async fn resolve(&self) -> Result<EffectiveSettings> {
        let stored = self.store.load_settings().await?;
        let patch = self.override_snapshot();

        Ok(EffectiveSettings {
            whisper_language: stored.whisper_language,
            whisper_model: stored.whisper_model,
            summary_model: patch
                .summary_model
                .clone()
                .unwrap_or(stored.summary_model),
            mind_map_model: patch
                .mind_map_model
                .clone()
                .unwrap_or(stored.mind_map_model),
            summary_prompt: patch
                .summary_prompt
                .clone()
                .unwrap_or(stored.summary_prompt),
            mind_map_prompt: patch
                .mind_map_prompt
                .clone()
                .unwrap_or(stored.mind_map_prompt),
            frame_length_ms: stored.frame_length_ms,
            frames_per_batch: stored.frames_per_batch,
        })
    }

    /// Replace the temporary override. Fields set in `patch` overwrite the
    /// previous override; fields left `None` fall back to the store again.
    pub fn set_override(&self, patch: TemporaryOverride) {
        let mut guard = self
            .current_override
            .write()
            .unwrap_or_else(|e| e.into_inner());
        info!("Applied temporary settings override");
        *guard = Arc::new(patch);
    }

    /// Clear the temporary override entirely.
    pub fn clear_override(&self) {
        let mut guard = self
            .current_override
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if !guard.is_empty() {
            info!("Cleared temporary settings override");
        }
        *guard = Arc::new(TemporaryOverride::default());
    }

    /// Snapshot of the current override.
    pub fn override_snapshot(&self) -> Arc<TemporaryOverride> {
        self.current_override
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }
}
