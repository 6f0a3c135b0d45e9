//! HTTP and websocket server for Samtale.

mod routes;
mod ws;

use crate::bus::SessionBus;
use crate::config::Config;
use crate::intake::AudioIntake;
use crate::llm::{ChatInvoker, LlmInvoker};
use crate::orchestrator::PipelineOrchestrator;
use crate::pipeline::{MindMapPipeline, SummaryPipeline};
use crate::processing::ProcessingStateManager;
use crate::settings::SettingsResolver;
use crate::store::{SqliteStore, Store};
use crate::transcription::{Transcriber, WhisperApiTranscriber};
use crate::worker::TranscriptionSupervisor;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared application state.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub resolver: Arc<SettingsResolver>,
    pub manager: Arc<ProcessingStateManager>,
    pub bus: Arc<SessionBus>,
    pub intake: Arc<AudioIntake>,
    pub supervisor: Arc<TranscriptionSupervisor>,
    pub orchestrator: Arc<PipelineOrchestrator>,
}

/// Wire the full pipeline around the given adapters and start the
/// orchestrator task.
pub fn build_state(
    config: &Config,
    store: Arc<dyn Store>,
    transcriber: Arc<dyn Transcriber>,
    invoker: Arc<dyn LlmInvoker>,
) -> Arc<AppState> {
    let bus = Arc::new(SessionBus::new());
    let resolver = Arc::new(SettingsResolver::new(store.clone()));
    let manager = Arc::new(ProcessingStateManager::new());
    let intake = Arc::new(AudioIntake::new(config.audio.queue_high_water));

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        resolver.clone(),
        manager.clone(),
        bus.clone(),
        store.clone(),
        SummaryPipeline::new(store.clone(), invoker.clone(), bus.clone()),
        MindMapPipeline::new(store.clone(), invoker, bus.clone()),
        config.llm.pool_size,
    ));

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    tokio::spawn(orchestrator.clone().run(signal_rx));

    let supervisor = Arc::new(TranscriptionSupervisor::new(
        intake.clone(),
        store.clone(),
        transcriber,
        resolver.clone(),
        bus.clone(),
        signal_tx,
        Duration::from_secs(config.audio.worker_idle_seconds),
    ));

    Arc::new(AppState {
        store,
        resolver,
        manager,
        bus,
        intake,
        supervisor,
        orchestrator,
    })
}

/// Build the router over the application state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/ws", get(ws::ws_upgrade))
        .route("/sessions", get(routes::list_sessions).post(routes::create_session))
        .route(
            "/sessions/{session_id}",
            get(routes::get_session)
                .patch(routes::rename_session)
                .delete(routes::delete_session),
        )
        .route(
            "/sessions/{session_id}/transcripts",
            get(routes::list_transcripts),
        )
        .route("/sessions/{session_id}/analyses", get(routes::list_analyses))
        .route(
            "/sessions/{session_id}/mind-maps",
            get(routes::list_mind_maps),
        )
        .route(
            "/settings",
            get(routes::get_settings).post(routes::update_settings),
        )
        .route(
            "/settings/apply-temporary",
            post(routes::apply_temporary_settings),
        )
        .route(
            "/settings/temporary-settings",
            get(routes::get_temporary_settings).delete(routes::clear_temporary_settings),
        )
        .route(
            "/processing-status/{session_id}",
            get(routes::processing_status),
        )
        .layer(cors)
        .with_state(state)
}

/// Run the server with production adapters.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&config.sqlite_path())?);
    let transcriber: Arc<dyn Transcriber> = Arc::new(WhisperApiTranscriber::new(
        &config.transcriber.api_base,
        config.transcriber.timeout_seconds,
    ));
    let invoker: Arc<dyn LlmInvoker> = Arc::new(ChatInvoker::new(
        &config.llm.api_base,
        config.llm.deadline_seconds,
    ));

    let state = build_state(&config, store, transcriber, invoker);
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
