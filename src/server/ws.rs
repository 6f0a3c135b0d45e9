//! Bidirectional client transport.
//!
//! One websocket connection per client, optionally carrying a session id in
//! the query string. Inbound traffic is either a JSON envelope
//! (`audio_chunk` / `status`) or a raw binary WAV frame; outbound traffic
//! mirrors the session's bus events wrapped in the same envelope shape.

use super::AppState;
use crate::bus::{ErrorNotice, SessionEvent, StatusNotice};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    session_id: Option<String>,
}

/// Outbound wire envelope around a bus event.
#[derive(Serialize)]
struct Envelope {
    #[serde(flatten)]
    event: SessionEvent,
    timestamp: DateTime<Utc>,
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Inbound wire envelope. `data` stays untyped until the kind is known.
#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AudioChunkData {
    data: String,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    action: String,
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.session_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: Option<String>) {
    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Err(e) = state.store.ensure_session(&session_id).await {
        warn!("Failed to ensure session {}: {}", session_id, e);
    }

    let mut events = state.bus.subscribe(&session_id);
    let (mut sink, mut stream) = socket.split();
    info!("Client connected for session {}", session_id);

    send_event(
        &mut sink,
        &session_id,
        SessionEvent::Status(StatusNotice {
            message: "Connected successfully".to_string(),
            session_id: session_id.clone(),
            status: "connected".to_string(),
        }),
    )
    .await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => send_event(&mut sink, &session_id, event).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!("Session {} client lagged, {} events dropped", session_id, missed);
                }
                Err(RecvError::Closed) => break,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&state, &session_id, text.as_str(), &mut sink).await;
                }
                Some(Ok(Message::Binary(frame))) => {
                    // raw binary frame: WAV bytes for the connection's session
                    if let Err(e) = state.store.touch_session(&session_id).await {
                        debug!("Failed to touch session {}: {}", session_id, e);
                    }
                    handle_frame(&state, &session_id, frame.to_vec()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Websocket error for session {}: {}", session_id, e);
                    break;
                }
            }
        }
    }

    // release the subscription; in-flight pipelines keep running and
    // persisting, their events simply have nobody to reach
    drop(events);
    state.bus.prune(&session_id);
    if let Err(e) = state.store.set_session_active(&session_id, false).await {
        debug!("Failed to deactivate session {}: {}", session_id, e);
    }
    info!("Client disconnected for session {}", session_id);
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    session_id: &str,
    event: SessionEvent,
) {
    let envelope = Envelope {
        event,
        timestamp: Utc::now(),
        session_id: session_id.to_string(),
    };
    match serde_json::to_string(&envelope) {
        Ok(payload) => {
            if let Err(e) = sink.send(Message::Text(payload.into())).await {
                debug!("Failed to send to session {}: {}", session_id, e);
            }
        }
        Err(e) => warn!("Failed to serialize event: {}", e),
    }
}

async fn handle_text(
    state: &Arc<AppState>,
    connection_session: &str,
    text: &str,
    sink: &mut SplitSink<WebSocket, Message>,
) {
    let envelope: InboundEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            send_event(
                sink,
                connection_session,
                SessionEvent::Error(ErrorNotice::new(format!("Malformed message: {}", e))),
            )
            .await;
            return;
        }
    };

    if let Err(e) = state.store.touch_session(connection_session).await {
        debug!("Failed to touch session {}: {}", connection_session, e);
    }

    match envelope.kind.as_str() {
        "audio_chunk" => {
            let chunk: AudioChunkData = match serde_json::from_value(envelope.data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    send_event(
                        sink,
                        connection_session,
                        SessionEvent::Error(ErrorNotice::new(format!(
                            "Malformed audio_chunk: {}",
                            e
                        ))),
                    )
                    .await;
                    return;
                }
            };

            // an explicit session id on the chunk wins over the connection's
            let session_id = chunk
                .session_id
                .or(envelope.session_id)
                .unwrap_or_else(|| connection_session.to_string());
            if session_id != connection_session {
                if let Err(e) = state.store.ensure_session(&session_id).await {
                    warn!("Failed to ensure session {}: {}", session_id, e);
                    return;
                }
            }

            let bytes = match decode_base64(&chunk.data) {
                Ok(bytes) => bytes,
                Err(e) => {
                    send_event(
                        sink,
                        connection_session,
                        SessionEvent::Error(ErrorNotice::new(format!(
                            "Failed to decode audio data: {}",
                            e
                        ))),
                    )
                    .await;
                    return;
                }
            };

            handle_frame(state, &session_id, bytes).await;
        }
        "status" => {
            let status: StatusData = match serde_json::from_value(envelope.data) {
                Ok(status) => status,
                Err(e) => {
                    send_event(
                        sink,
                        connection_session,
                        SessionEvent::Error(ErrorNotice::new(format!("Malformed status: {}", e))),
                    )
                    .await;
                    return;
                }
            };
            handle_status(state, connection_session, &status.action, sink).await;
        }
        other => {
            send_event(
                sink,
                connection_session,
                SessionEvent::Error(ErrorNotice::new(format!("Unknown message type: {}", other))),
            )
            .await;
        }
    }
}

async fn handle_status(
    state: &Arc<AppState>,
    session_id: &str,
    action: &str,
    sink: &mut SplitSink<WebSocket, Message>,
) {
    match action {
        "start_stream" => {
            if let Err(e) = state.store.set_session_active(session_id, true).await {
                warn!("Failed to activate session {}: {}", session_id, e);
            }
            send_event(
                sink,
                session_id,
                SessionEvent::Status(StatusNotice {
                    message: "Audio streaming started".to_string(),
                    session_id: session_id.to_string(),
                    status: "streaming".to_string(),
                }),
            )
            .await;
        }
        "stop_stream" => {
            // flush any trailing sub-batch so short recordings are not lost
            match state.intake.flush(session_id) {
                Ok(true) => state.supervisor.ensure_worker(session_id),
                Ok(false) => {}
                Err(e) => warn!("Flush failed for session {}: {}", session_id, e),
            }
            if let Err(e) = state.store.set_session_active(session_id, false).await {
                warn!("Failed to deactivate session {}: {}", session_id, e);
            }
            send_event(
                sink,
                session_id,
                SessionEvent::Status(StatusNotice {
                    message: "Audio streaming stopped".to_string(),
                    session_id: session_id.to_string(),
                    status: "stopped".to_string(),
                }),
            )
            .await;
        }
        other => {
            send_event(
                sink,
                session_id,
                SessionEvent::Error(ErrorNotice::new(format!("Unknown status action: {}", other))),
            )
            .await;
        }
    }
}

/// Validate and enqueue one frame, surfacing level/overflow/rejection as
/// session events.
async fn handle_frame(state: &Arc<AppState>, session_id: &str, bytes: Vec<u8>) {
    let frames_per_batch = match state.resolver.resolve().await {
        Ok(settings) => settings.frames_per_batch,
        Err(e) => {
            warn!("Failed to resolve settings: {}", e);
            return;
        }
    };

    state.supervisor.ensure_worker(session_id);

    match state.intake.accept_frame(session_id, bytes, frames_per_batch) {
        Ok(accepted) => {
            state.bus.publish(
                session_id,
                SessionEvent::AudioLevel(crate::bus::AudioLevel {
                    audio_level: accepted.audio_level,
                    session_id: session_id.to_string(),
                }),
            );
            if accepted.dropped_oldest {
                let overflow = crate::error::SamtaleError::Overflow(session_id.to_string());
                state.bus.publish(
                    session_id,
                    SessionEvent::Error(ErrorNotice::new(overflow.to_string())),
                );
            }
        }
        Err(e) => {
            // reject the frame, keep the session
            debug!("Rejected frame for session {}: {}", session_id, e);
            state.bus.publish(
                session_id,
                SessionEvent::Error(ErrorNotice::new(e.to_string())),
            );
        }
    }
}

fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    // clients occasionally drop the padding
    let trimmed = data.trim();
    let padding = (4 - trimmed.len() % 4) % 4;
    let padded;
    let input = if padding > 0 {
        padded = format!("{}{}", trimmed, "=".repeat(padding));
        padded.as_str()
    } else {
        trimmed
    };
    base64::engine::general_purpose::STANDARD.decode(input)
}
