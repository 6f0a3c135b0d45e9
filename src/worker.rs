//! Per-session transcription workers.
//!
//! One worker task per active session, spawned on first audio and retired
//! after an idle timeout so dormant sessions do not pin tasks. A worker
//! drains its session's intake queue strictly in order, so transcripts for
//! one session always land in arrival order.

use crate::bus::{ErrorNotice, SessionBus, SessionEvent, TranscriptionResult};
use crate::intake::{AudioIntake, FrameUnit};
use crate::orchestrator::NewTranscript;
use crate::settings::SettingsResolver;
use crate::store::Store;
use crate::transcription::Transcriber;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Spawns and retires transcription workers per session.
pub struct TranscriptionSupervisor {
    intake: Arc<AudioIntake>,
    store: Arc<dyn Store>,
    transcriber: Arc<dyn Transcriber>,
    resolver: Arc<SettingsResolver>,
    bus: Arc<SessionBus>,
    signals: mpsc::UnboundedSender<NewTranscript>,
    idle_timeout: Duration,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TranscriptionSupervisor {
    pub fn new(
        intake: Arc<AudioIntake>,
        store: Arc<dyn Store>,
        transcriber: Arc<dyn Transcriber>,
        resolver: Arc<SettingsResolver>,
        bus: Arc<SessionBus>,
        signals: mpsc::UnboundedSender<NewTranscript>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            intake,
            store,
            transcriber,
            resolver,
            bus,
            signals,
            idle_timeout,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a worker task is running for the session. Called by the
    /// transport whenever a frame arrives.
    pub fn ensure_worker(self: &Arc<Self>, session_id: &str) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = workers.get(session_id) {
            if !handle.is_finished() {
                return;
            }
        }

        let supervisor = self.clone();
        let session_id_owned = session_id.to_string();
        let handle = tokio::spawn(async move {
            supervisor.run_worker(session_id_owned).await;
        });
        workers.insert(session_id.to_string(), handle);
        debug!("Spawned transcription worker for session {}", session_id);
    }

    /// Number of live worker tasks.
    pub fn worker_count(&self) -> usize {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.values().filter(|h| !h.is_finished()).count()
    }

    async fn run_worker(self: Arc<Self>, session_id: String) {
        loop {
            match tokio::time::timeout(self.idle_timeout, self.intake.pop(&session_id)).await {
                Ok(unit) => self.process_unit(unit).await,
                Err(_) => {
                    if self.intake.queue_depth(&session_id) > 0 {
                        continue;
                    }
                    info!(
                        "Transcription worker for session {} idle, retiring",
                        session_id
                    );
                    break;
                }
            }
        }

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.remove(&session_id);
        drop(workers);
        self.intake.remove_session(&session_id);
    }

    async fn process_unit(&self, unit: FrameUnit) {
        let session_id = unit.session_id.clone();

        let settings = match self.resolver.resolve().await {
            Ok(settings) => settings,
            Err(e) => {
                error!("Failed to resolve settings for session {}: {}", session_id, e);
                return;
            }
        };

        let outcome = self
            .transcriber
            .transcribe(
                unit.bytes,
                Some(settings.whisper_language.as_str()),
                &settings.whisper_model,
            )
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // frame-level faults never tear down the session
                warn!("Transcription failed for session {}: {}", session_id, e);
                self.bus.publish(
                    &session_id,
                    SessionEvent::Error(ErrorNotice::new(e.to_string())),
                );
                return;
            }
        };

        if let Err(e) = self.store.touch_session(&session_id).await {
            warn!("Failed to bump activity for session {}: {}", session_id, e);
        }

        if outcome.is_empty() {
            debug!("Empty transcription for session {}, not persisting", session_id);
            self.bus.publish(
                &session_id,
                SessionEvent::TranscriptionResult(TranscriptionResult {
                    success: true,
                    text: String::new(),
                    language: outcome.language,
                    model: Some(outcome.model),
                    session_id: session_id.clone(),
                    transcript_id: None,
                }),
            );
            return;
        }

        let transcript = match self
            .store
            .insert_transcript(
                &session_id,
                &outcome.text,
                outcome.language.as_deref(),
                Some(&outcome.model),
            )
            .await
        {
            Ok(transcript) => transcript,
            Err(e) => {
                error!("Failed to persist transcript for session {}: {}", session_id, e);
                self.bus.publish(
                    &session_id,
                    SessionEvent::Error(ErrorNotice::new(format!(
                        "Failed to save transcript: {}",
                        e
                    ))),
                );
                return;
            }
        };

        self.bus.publish(
            &session_id,
            SessionEvent::TranscriptionResult(TranscriptionResult {
                success: true,
                text: transcript.text.clone(),
                language: transcript.language.clone(),
                model: transcript.model.clone(),
                session_id: session_id.clone(),
                transcript_id: Some(transcript.id),
            }),
        );

        // the worker never calls the LLM itself; the orchestrator decides
        let _ = self.signals.send(NewTranscript {
            session_id,
            transcript_id: transcript.id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::make_test_wav;
    use crate::error::{Result, SamtaleError};
    use crate::store::SqliteStore;
    use crate::transcription::TranscriptionOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTranscriber {
        calls: AtomicUsize,
        /// Empty string simulates a silent frame; "fail" simulates an error.
        script: Vec<String>,
    }

    #[async_trait]
    impl Transcriber for CountingTranscriber {
        async fn transcribe(
            &self,
            _audio: Vec<u8>,
            _language: Option<&str>,
            model: &str,
        ) -> Result<TranscriptionOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let text = self
                .script
                .get(call)
                .cloned()
                .unwrap_or_else(|| format!("utterance {}", call));
            if text == "fail" {
                return Err(SamtaleError::Transcription("engine exploded".to_string()));
            }
            Ok(TranscriptionOutcome {
                text,
                language: Some("en".to_string()),
                model: model.to_string(),
            })
        }
    }

    struct Harness {
        intake: Arc<AudioIntake>,
        store: Arc<dyn Store>,
        bus: Arc<SessionBus>,
        supervisor: Arc<TranscriptionSupervisor>,
        signals: mpsc::UnboundedReceiver<NewTranscript>,
    }

    fn harness(script: Vec<String>, idle: Duration) -> Harness {
        let intake = Arc::new(AudioIntake::new(8));
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let bus = Arc::new(SessionBus::new());
        let resolver = Arc::new(SettingsResolver::new(store.clone()));
        let (tx, rx) = mpsc::unbounded_channel();

        let supervisor = Arc::new(TranscriptionSupervisor::new(
            intake.clone(),
            store.clone(),
            Arc::new(CountingTranscriber {
                calls: AtomicUsize::new(0),
                script,
            }),
            resolver,
            bus.clone(),
            tx,
            idle,
        ));

        Harness {
            intake,
            store,
            bus,
            supervisor,
            signals: rx,
        }
    }

    fn push_unit(h: &Harness, session_id: &str) {
        h.intake
            .accept_frame(session_id, make_test_wav(16_000, 1, &[100; 160]), 1)
            .unwrap();
    }

    #[tokio::test]
    async fn test_transcribes_in_order_and_signals() {
        let mut h = harness(vec![], Duration::from_secs(10));
        h.store.ensure_session("s1").await.unwrap();
        let mut events = h.bus.subscribe("s1");

        push_unit(&h, "s1");
        push_unit(&h, "s1");
        h.supervisor.ensure_worker("s1");

        let first = h.signals.recv().await.unwrap();
        let second = h.signals.recv().await.unwrap();
        assert!(second.transcript_id > first.transcript_id);

        let transcripts = h.store.list_transcripts("s1").await.unwrap();
        assert_eq!(transcripts.len(), 2);
        assert_eq!(transcripts[0].text, "utterance 0");
        assert_eq!(transcripts[1].text, "utterance 1");

        // events carry strictly increasing transcript ids
        let mut last_id = 0;
        for _ in 0..2 {
            match events.recv().await.unwrap() {
                SessionEvent::TranscriptionResult(r) => {
                    let id = r.transcript_id.unwrap();
                    assert!(id > last_id);
                    last_id = id;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_empty_text_does_not_signal() {
        let mut h = harness(vec!["   ".to_string()], Duration::from_secs(10));
        h.store.ensure_session("s1").await.unwrap();
        let mut events = h.bus.subscribe("s1");

        push_unit(&h, "s1");
        h.supervisor.ensure_worker("s1");

        match events.recv().await.unwrap() {
            SessionEvent::TranscriptionResult(r) => {
                assert!(r.success);
                assert!(r.transcript_id.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(h.store.list_transcripts("s1").await.unwrap().is_empty());
        assert!(h.signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transcriber_error_drops_frame_and_continues() {
        let mut h = harness(
            vec!["fail".to_string(), "recovered".to_string()],
            Duration::from_secs(10),
        );
        h.store.ensure_session("s1").await.unwrap();
        let mut events = h.bus.subscribe("s1");

        push_unit(&h, "s1");
        push_unit(&h, "s1");
        h.supervisor.ensure_worker("s1");

        match events.recv().await.unwrap() {
            SessionEvent::Error(e) => assert!(e.error.contains("engine exploded")),
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await.unwrap() {
            SessionEvent::TranscriptionResult(r) => assert_eq!(r.text, "recovered"),
            other => panic!("unexpected event: {:?}", other),
        }

        let signal = h.signals.recv().await.unwrap();
        assert_eq!(signal.session_id, "s1");
        assert_eq!(h.store.list_transcripts("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_retires_when_idle() {
        let mut h = harness(vec![], Duration::from_millis(50));
        h.store.ensure_session("s1").await.unwrap();

        push_unit(&h, "s1");
        h.supervisor.ensure_worker("s1");
        h.signals.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.supervisor.worker_count(), 0);

        // a new frame respawns a worker
        push_unit(&h, "s1");
        h.supervisor.ensure_worker("s1");
        assert_eq!(h.supervisor.worker_count(), 1);
        h.signals.recv().await.unwrap();
    }
}
