//! Session summary pipeline.

use super::load_corpus;
use crate::bus::{SessionAnalysis, SessionBus, SessionEvent};
use crate::config::Prompts;
use crate::error::Result;
use crate::llm::LlmInvoker;
use crate::settings::EffectiveSettings;
use crate::store::{Analysis, Store};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

/// Outcome of one summary run.
#[derive(Debug)]
pub struct SummaryRun {
    pub analysis: Analysis,
    /// Highest transcript id the run ingested.
    pub max_transcript_id: i64,
}

/// Composes the summary prompt, invokes the LLM, persists the analysis and
/// publishes it to the session.
pub struct SummaryPipeline {
    store: Arc<dyn Store>,
    invoker: Arc<dyn LlmInvoker>,
    bus: Arc<SessionBus>,
}

impl SummaryPipeline {
    pub fn new(store: Arc<dyn Store>, invoker: Arc<dyn LlmInvoker>, bus: Arc<SessionBus>) -> Self {
        Self { store, invoker, bus }
    }

    /// Run the pipeline over the session's current transcript corpus.
    ///
    /// Invoker failures propagate without persisting anything; slot release
    /// is the caller's responsibility (scoped guard in the orchestrator).
    #[instrument(skip(self, settings), fields(model = %settings.summary_model))]
    pub async fn run(
        &self,
        session_id: &str,
        settings: &EffectiveSettings,
    ) -> Result<SummaryRun> {
        let corpus = load_corpus(&self.store, session_id).await?;
        let prompt = Prompts::compose(&settings.summary_prompt, session_id, &corpus.text);

        let started = Instant::now();
        let response = self.invoker.invoke(&settings.summary_model, &prompt).await?;
        let processing_time = started.elapsed().as_secs_f64();

        let analysis = self
            .store
            .insert_analysis(
                session_id,
                &prompt,
                &response,
                &settings.summary_model,
                processing_time,
            )
            .await?;

        info!(
            "Summary for session {} completed in {:.2}s (analysis {})",
            session_id, processing_time, analysis.id
        );

        self.bus.publish(
            session_id,
            SessionEvent::SessionAnalysis(SessionAnalysis {
                session_id: session_id.to_string(),
                analysis_id: analysis.id,
                processing_time,
                analysis: analysis.response.clone(),
            }),
        );

        Ok(SummaryRun {
            analysis,
            max_transcript_id: corpus.max_transcript_id,
        })
    }
}
