//! Pipeline orchestration.
//!
//! Every persisted transcript fires a `NewTranscript` signal. For each
//! operation kind the orchestrator resolves a settings snapshot, honors the
//! `"none"` sentinel, waits for a worker-pool permit, and claims the
//! session's processing slot at dequeue time. A refused claim is never
//! queued: the signal is dropped, the client is told, and a single fresh run
//! over the latest corpus is scheduled once the in-flight run releases the
//! slot. One fresh run over the full session state beats N stale queued
//! runs.

use crate::bus::{ErrorNotice, ProcessingStatus, SessionBus, SessionEvent};
use crate::error::SamtaleError;
use crate::pipeline::{MindMapPipeline, SummaryPipeline};
use crate::processing::{OperationKind, ProcessingStateManager, SlotGuard};
use crate::settings::{EffectiveSettings, SettingsResolver};
use crate::store::Store;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// Signal that a transcript was persisted for a session.
#[derive(Debug, Clone)]
pub struct NewTranscript {
    pub session_id: String,
    pub transcript_id: i64,
}

/// Highest transcript id each pipeline kind has ingested for a session.
/// `processed_at` is stamped up to the minimum of the two.
#[derive(Debug, Default, Clone, Copy)]
struct Watermarks {
    summary: i64,
    mind_map: i64,
}

/// Wires transcription signals to the LLM pipelines.
pub struct PipelineOrchestrator {
    resolver: Arc<SettingsResolver>,
    manager: Arc<ProcessingStateManager>,
    bus: Arc<SessionBus>,
    store: Arc<dyn Store>,
    summary: SummaryPipeline,
    mind_map: MindMapPipeline,
    pool: Arc<Semaphore>,
    /// `(session, kind)` pairs owed a fresh run once the busy slot clears.
    pending: Mutex<HashSet<(String, OperationKind)>>,
    watermarks: Mutex<HashMap<String, Watermarks>>,
}

impl PipelineOrchestrator {
    pub fn new(
        resolver: Arc<SettingsResolver>,
        manager: Arc<ProcessingStateManager>,
        bus: Arc<SessionBus>,
        store: Arc<dyn Store>,
        summary: SummaryPipeline,
        mind_map: MindMapPipeline,
        pool_size: usize,
    ) -> Self {
        Self {
            resolver,
            manager,
            bus,
            store,
            summary,
            mind_map,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            pending: Mutex::new(HashSet::new()),
            watermarks: Mutex::new(HashMap::new()),
        }
    }

    /// Consume transcription signals until the channel closes.
    pub async fn run(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<NewTranscript>) {
        info!("Pipeline orchestrator started");
        while let Some(signal) = signals.recv().await {
            debug!(
                "New transcript {} for session {}",
                signal.transcript_id, signal.session_id
            );
            self.clone()
                .trigger(signal.session_id.clone(), OperationKind::Summary);
            self.clone()
                .trigger(signal.session_id, OperationKind::MindMap);
        }
        info!("Pipeline orchestrator stopped");
    }

    /// Schedule one pipeline attempt for `(session, kind)` on the pool.
    pub fn trigger(self: Arc<Self>, session_id: String, kind: OperationKind) {
        tokio::spawn(async move {
            // settings snapshot for this job; mid-run changes do not apply
            let settings = match self.resolver.resolve().await {
                Ok(settings) => settings,
                Err(e) => {
                    error!("Failed to resolve settings: {}", e);
                    return;
                }
            };

            let enabled = match kind {
                OperationKind::Summary => settings.summary_enabled(),
                OperationKind::MindMap => settings.mind_map_enabled(),
            };
            if !enabled {
                debug!("{} disabled for session {}, skipping", kind, session_id);
                return;
            }

            // pool dequeue; the busy flag is only set from here on, so
            // status reads never report a queued-but-not-running pipeline
            let _permit = self
                .pool
                .clone()
                .acquire_owned()
                .await
                .expect("pipeline pool semaphore closed");

            let Some(guard) = SlotGuard::claim(&self.manager, &session_id, kind) else {
                // a run is in flight; this transcript will be covered by
                // exactly one fresh run once that slot clears
                debug!(
                    "{} already running for session {}, skipping",
                    kind, session_id
                );
                self.mark_pending(&session_id, kind);
                self.bus.publish(
                    &session_id,
                    SessionEvent::ProcessingStatus(ProcessingStatus {
                        session_id: session_id.clone(),
                        operation: kind,
                        status: "skipped".to_string(),
                    }),
                );
                return;
            };

            let outcome = match kind {
                OperationKind::Summary => self
                    .summary
                    .run(&session_id, &settings)
                    .await
                    .map(|run| run.max_transcript_id),
                OperationKind::MindMap => self
                    .mind_map
                    .run(&session_id, &settings)
                    .await
                    .map(|run| run.max_transcript_id),
            };

            // release before any follow-up so a rerun can claim the slot
            drop(guard);

            match outcome {
                Ok(max_transcript_id) => {
                    self.record_watermark(&session_id, kind, max_transcript_id, &settings)
                        .await;
                }
                Err(SamtaleError::NoContent(_)) => {
                    debug!("No transcripts for session {}, nothing to do", session_id);
                }
                Err(SamtaleError::InvalidMindMap { reason, raw }) => {
                    warn!(
                        "Mind map for session {} unusable after repair: {}",
                        session_id, reason
                    );
                    self.bus.publish(
                        &session_id,
                        SessionEvent::Error(ErrorNotice {
                            error: format!("Invalid mind map response: {}", reason),
                            raw: Some(raw),
                        }),
                    );
                }
                Err(e) => {
                    warn!("{} pipeline failed for session {}: {}", kind, session_id, e);
                    self.bus.publish(
                        &session_id,
                        SessionEvent::Error(ErrorNotice::new(format!(
                            "{} pipeline failed: {}",
                            kind, e
                        ))),
                    );
                }
            }

            if self.take_pending(&session_id, kind) {
                debug!(
                    "Rerunning {} for session {} to cover skipped transcripts",
                    kind, session_id
                );
                self.clone().trigger(session_id, kind);
            }
        });
    }

    fn mark_pending(&self, session_id: &str, kind: OperationKind) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert((session_id.to_string(), kind));
    }

    fn take_pending(&self, session_id: &str, kind: OperationKind) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&(session_id.to_string(), kind))
    }

    /// Record how far a kind has read and stamp `processed_at` up to the
    /// point both kinds have covered. A disabled kind counts as having
    /// considered everything.
    async fn record_watermark(
        &self,
        session_id: &str,
        kind: OperationKind,
        max_transcript_id: i64,
        settings: &EffectiveSettings,
    ) {
        let floor = {
            let mut marks = self.watermarks.lock().unwrap_or_else(|e| e.into_inner());
            let entry = marks.entry(session_id.to_string()).or_default();
            match kind {
                OperationKind::Summary => entry.summary = entry.summary.max(max_transcript_id),
                OperationKind::MindMap => entry.mind_map = entry.mind_map.max(max_transcript_id),
            }

            let summary = if settings.summary_enabled() {
                entry.summary
            } else {
                i64::MAX
            };
            let mind_map = if settings.mind_map_enabled() {
                entry.mind_map
            } else {
                i64::MAX
            };
            summary.min(mind_map)
        };

        if floor > 0 {
            if let Err(e) = self.store.mark_transcripts_processed(session_id, floor).await {
                warn!(
                    "Failed to mark transcripts processed for session {}: {}",
                    session_id, e
                );
            }
        }
    }

    /// Drop bookkeeping for a deleted session.
    pub fn forget_session(&self, session_id: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|(session, _)| session != session_id);
        drop(pending);
        let mut marks = self.watermarks.lock().unwrap_or_else(|e| e.into_inner());
        marks.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::llm::LlmInvoker;
    use crate::settings::TemporaryOverride;
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use std::time::Duration;

    const VALID_GRAPH: &str =
        r#"{"nodes":[{"id":"a","label":"Alpha"},{"id":"b","label":"Beta"}],"edges":[{"id":"e1","source":"a","target":"b"}]}"#;

    /// Invoker that sleeps, records the model it was called with, and
    /// returns a response valid for both pipelines.
    struct SlowInvoker {
        delay: Duration,
        models_seen: Mutex<Vec<String>>,
    }

    impl SlowInvoker {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                models_seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmInvoker for SlowInvoker {
        async fn invoke(&self, model: &str, _prompt: &str) -> Result<String> {
            self.models_seen.lock().unwrap().push(model.to_string());
            tokio::time::sleep(self.delay).await;
            Ok(VALID_GRAPH.to_string())
        }
    }

    struct Harness {
        store: Arc<dyn Store>,
        resolver: Arc<SettingsResolver>,
        manager: Arc<ProcessingStateManager>,
        signals: mpsc::UnboundedSender<NewTranscript>,
        invoker: Arc<SlowInvoker>,
    }

    async fn harness(delay: Duration) -> Harness {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        let bus = Arc::new(SessionBus::new());
        let resolver = Arc::new(SettingsResolver::new(store.clone()));
        let manager = Arc::new(ProcessingStateManager::new());
        let invoker = SlowInvoker::new(delay);

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            resolver.clone(),
            manager.clone(),
            bus.clone(),
            store.clone(),
            SummaryPipeline::new(store.clone(), invoker.clone(), bus.clone()),
            MindMapPipeline::new(store.clone(), invoker.clone(), bus.clone()),
            2,
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(orchestrator.run(rx));

        Harness {
            store,
            resolver,
            manager,
            signals: tx,
            invoker,
        }
    }

    async fn add_transcript(h: &Harness, session_id: &str, text: &str) -> i64 {
        let transcript = h
            .store
            .insert_transcript(session_id, text, None, None)
            .await
            .unwrap();
        h.signals
            .send(NewTranscript {
                session_id: session_id.to_string(),
                transcript_id: transcript.id,
            })
            .unwrap();
        transcript.id
    }

    /// Wait until no slot has been busy for several consecutive checks, so
    /// catch-up reruns have either started (busy again) or finished.
    async fn settle(h: &Harness) {
        let mut idle_streak = 0;
        for _ in 0..400 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if h.manager.tracked_sessions() == 0 {
                idle_streak += 1;
                if idle_streak >= 6 {
                    return;
                }
            } else {
                idle_streak = 0;
            }
        }
        panic!("pipelines never settled");
    }

    #[tokio::test]
    async fn test_happy_path_produces_both_artifacts() {
        let h = harness(Duration::from_millis(10)).await;
        h.store.ensure_session("s1").await.unwrap();

        add_transcript(&h, "s1", "hello world").await;
        settle(&h).await;

        assert_eq!(h.store.list_analyses("s1").await.unwrap().len(), 1);
        assert_eq!(h.store.list_mind_maps("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_queue_buildup_under_burst() {
        let h = harness(Duration::from_millis(300)).await;
        h.store.ensure_session("s2").await.unwrap();

        // mind map disabled so the pool is dedicated to summaries
        h.resolver.set_override(TemporaryOverride {
            mind_map_model: Some("none".to_string()),
            ..Default::default()
        });

        for i in 0..5 {
            add_transcript(&h, "s2", &format!("utterance {}", i)).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        settle(&h).await;

        // first run plus exactly one catch-up run over all five transcripts
        let analyses = h.store.list_analyses("s2").await.unwrap();
        assert_eq!(analyses.len(), 2);
        assert!(analyses[0].prompt.contains("utterance 4"));
    }

    #[tokio::test]
    async fn test_disabled_summary_never_runs() {
        let h = harness(Duration::from_millis(10)).await;
        h.store.ensure_session("s4").await.unwrap();

        h.resolver.set_override(TemporaryOverride {
            summary_model: Some("none".to_string()),
            ..Default::default()
        });

        for i in 0..3 {
            add_transcript(&h, "s4", &format!("utterance {}", i)).await;
        }
        settle(&h).await;

        assert!(h.store.list_analyses("s4").await.unwrap().is_empty());
        // mind map still runs
        assert!(!h.store.list_mind_maps("s4").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settings_snapshot_survives_override_change() {
        let h = harness(Duration::from_millis(200)).await;
        h.store.ensure_session("s3").await.unwrap();
        h.resolver.set_override(TemporaryOverride {
            summary_model: Some("model-a".to_string()),
            mind_map_model: Some("none".to_string()),
            ..Default::default()
        });

        add_transcript(&h, "s3", "hello").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // change the override while the call is still in flight
        h.resolver.set_override(TemporaryOverride {
            summary_model: Some("model-b".to_string()),
            mind_map_model: Some("none".to_string()),
            ..Default::default()
        });
        settle(&h).await;

        let models = h.invoker.models_seen.lock().unwrap().clone();
        assert_eq!(models, vec!["model-a".to_string()]);

        let analyses = h.store.list_analyses("s3").await.unwrap();
        assert_eq!(analyses[0].model, "model-a");
    }

    #[tokio::test]
    async fn test_slots_clean_after_runs() {
        let h = harness(Duration::from_millis(10)).await;
        h.store.ensure_session("s5").await.unwrap();

        for i in 0..4 {
            add_transcript(&h, "s5", &format!("utterance {}", i)).await;
        }
        settle(&h).await;

        assert_eq!(h.manager.tracked_sessions(), 0);
        assert!(!h.manager.is_any_busy("s5"));
    }

    #[tokio::test]
    async fn test_processed_watermark_stamped() {
        let h = harness(Duration::from_millis(10)).await;
        h.store.ensure_session("s6").await.unwrap();

        let id = add_transcript(&h, "s6", "hello world").await;
        settle(&h).await;

        let transcripts = h.store.list_transcripts("s6").await.unwrap();
        let stamped = transcripts.iter().find(|t| t.id == id).unwrap();
        assert!(stamped.processed_at.is_some());
    }
}
