//! LLM pipelines deriving per-session artifacts.
//!
//! Each pipeline run works over the session's full transcript corpus at the
//! moment it starts, with the settings snapshot it was handed. Concurrency
//! control lives in the orchestrator; pipelines only do the work.

mod mind_map;
mod summary;

pub use mind_map::{MindMapPipeline, MindMapRun};
pub use summary::{SummaryPipeline, SummaryRun};

use crate::error::{Result, SamtaleError};
use crate::store::Store;
use std::sync::Arc;

/// The session corpus: concatenated transcript texts and the highest
/// transcript id that contributed.
#[derive(Debug)]
pub(crate) struct Corpus {
    pub text: String,
    pub max_transcript_id: i64,
}

/// Load all transcripts for a session in creation order and join their
/// texts with single spaces. Fails with `NoContent` when the session has no
/// transcripts yet.
pub(crate) async fn load_corpus(store: &Arc<dyn Store>, session_id: &str) -> Result<Corpus> {
    let transcripts = store.list_transcripts(session_id).await?;
    if transcripts.is_empty() {
        return Err(SamtaleError::NoContent(session_id.to_string()));
    }

    let max_transcript_id = transcripts.iter().map(|t| t.id).max().unwrap_or(0);
    let text = transcripts
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    Ok(Corpus {
        text,
        max_transcript_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn test_corpus_joins_in_order() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        store.ensure_session("s1").await.unwrap();
        store
            .insert_transcript("s1", "hello", None, None)
            .await
            .unwrap();
        let last = store
            .insert_transcript("s1", "world", None, None)
            .await
            .unwrap();

        let corpus = load_corpus(&store, "s1").await.unwrap();
        assert_eq!(corpus.text, "hello world");
        assert_eq!(corpus.max_transcript_id, last.id);
    }

    #[tokio::test]
    async fn test_corpus_empty_session() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        store.ensure_session("s1").await.unwrap();

        let err = load_corpus(&store, "s1").await.unwrap_err();
        assert!(matches!(err, SamtaleError::NoContent(_)));
    }
}
