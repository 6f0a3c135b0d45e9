//! REST endpoints: session CRUD, settings, processing status.

use super::AppState;
use crate::error::SamtaleError;
use crate::settings::TemporaryOverride;
use crate::store::SettingsUpdate;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(e: SamtaleError) -> axum::response::Response {
    let status = match e {
        SamtaleError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        SamtaleError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// === Sessions ===

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    name: Option<String>,
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_sessions().await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let session_id = uuid::Uuid::new_v4().to_string();
    match state
        .store
        .create_session(&session_id, req.name.as_deref())
        .await
    {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_session(&session_id).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => error_response(SamtaleError::SessionNotFound(session_id)),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct RenameSessionRequest {
    name: String,
}

pub async fn rename_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<RenameSessionRequest>,
) -> impl IntoResponse {
    match state.store.rename_session(&session_id, &req.name).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_session(&session_id).await {
        Ok(()) => {
            state.orchestrator.forget_session(&session_id);
            Json(serde_json::json!({ "deleted": session_id })).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn list_transcripts(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_transcripts(&session_id).await {
        Ok(transcripts) => Json(transcripts).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_analyses(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_analyses(&session_id).await {
        Ok(analyses) => Json(analyses).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_mind_maps(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_mind_maps(&session_id).await {
        Ok(maps) => Json(maps).into_response(),
        Err(e) => error_response(e),
    }
}

// === Settings ===

pub async fn get_settings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.load_settings().await {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SettingsUpdate>,
) -> impl IntoResponse {
    match state.store.update_settings(&update).await {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => error_response(e),
    }
}

/// Temporary-override request in the client's field naming. `ollamaModel`
/// patches both model fields; the specific fields win when both are given.
#[derive(Debug, Default, Deserialize)]
pub struct TemporarySettingsRequest {
    #[serde(rename = "ollamaModel")]
    ollama_model: Option<String>,
    #[serde(rename = "ollamaSummaryModel")]
    ollama_summary_model: Option<String>,
    #[serde(rename = "ollamaMindMapModel")]
    ollama_mind_map_model: Option<String>,
    #[serde(rename = "ollamaTaskPrompt")]
    ollama_task_prompt: Option<String>,
    #[serde(rename = "ollamaMindMapPrompt")]
    ollama_mind_map_prompt: Option<String>,
}

impl TemporarySettingsRequest {
    fn into_override(self) -> TemporaryOverride {
        let TemporarySettingsRequest {
            ollama_model,
            ollama_summary_model,
            ollama_mind_map_model,
            ollama_task_prompt,
            ollama_mind_map_prompt,
        } = self;
        TemporaryOverride {
            summary_model: ollama_summary_model.or_else(|| ollama_model.clone()),
            mind_map_model: ollama_mind_map_model.or(ollama_model),
            summary_prompt: ollama_task_prompt,
            mind_map_prompt: ollama_mind_map_prompt,
        }
    }
}

pub async fn apply_temporary_settings(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TemporarySettingsRequest>,
) -> impl IntoResponse {
    let patch = req.into_override();
    if patch.is_empty() {
        return error_response(SamtaleError::InvalidInput(
            "no overridable settings provided".to_string(),
        ));
    }

    state.resolver.set_override(patch);

    // respond with the full effective view so the client sees what applied
    match state.resolver.resolve().await {
        Ok(effective) => Json(effective).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_temporary_settings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.resolver.override_snapshot().as_ref().clone())
}

pub async fn clear_temporary_settings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.resolver.clear_override();
    Json(serde_json::json!({ "cleared": true }))
}

// === Processing status ===

pub async fn processing_status(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    Json(state.manager.status(&session_id))
}
