//! Mind-map pipeline: LLM invocation, JSON extraction, validation, and a
//! single repair attempt.
//!
//! Models wrap the requested JSON in prose more often than not, so the
//! pipeline first carves out the largest brace-balanced object from the raw
//! response. If that object still fails to parse or validate, the model gets
//! exactly one chance to correct its own output; more retries would let a
//! confused model monopolize the backend.

use super::load_corpus;
use crate::bus::{MindMapResult, SessionBus, SessionEvent};
use crate::config::Prompts;
use crate::error::{Result, SamtaleError};
use crate::llm::LlmInvoker;
use crate::settings::EffectiveSettings;
use crate::store::{MindMap, MindMapEdge, MindMapNode, Store};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Outcome of one mind-map run.
#[derive(Debug)]
pub struct MindMapRun {
    pub mind_map: MindMap,
    /// Highest transcript id the run ingested.
    pub max_transcript_id: i64,
}

#[derive(Debug, Deserialize)]
struct MindMapShape {
    nodes: Vec<MindMapNode>,
    edges: Vec<MindMapEdge>,
}

/// Extract the largest brace-balanced `{...}` substring, skipping braces
/// inside JSON strings. Returns None when no balanced object exists.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    let mut best: Option<(usize, usize)> = None;

    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        let span = (start, i + 1);
                        if best.is_none_or(|(s, e)| span.1 - span.0 > e - s) {
                            best = Some(span);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(s, e)| &raw[s..e])
}

/// Parse a raw LLM response into a validated node/edge pair.
fn parse_response(raw: &str) -> std::result::Result<(Vec<MindMapNode>, Vec<MindMapEdge>), String> {
    let json = extract_json_object(raw).ok_or("no JSON object found in response")?;
    let shape: MindMapShape =
        serde_json::from_str(json).map_err(|e| format!("JSON parse error: {}", e))?;
    validate_graph(&shape.nodes, &shape.edges)?;
    Ok((shape.nodes, shape.edges))
}

/// Check the structural invariants: unique non-empty node ids, non-empty
/// labels, unique edge ids, and edge endpoints that resolve to node ids.
fn validate_graph(nodes: &[MindMapNode], edges: &[MindMapEdge]) -> std::result::Result<(), String> {
    let mut node_ids = HashSet::new();
    for node in nodes {
        if node.id.trim().is_empty() {
            return Err("node with empty id".to_string());
        }
        if node.label.trim().is_empty() {
            return Err(format!("node '{}' has an empty label", node.id));
        }
        if !node_ids.insert(node.id.as_str()) {
            return Err(format!("duplicate node id '{}'", node.id));
        }
    }

    let mut edge_ids = HashSet::new();
    for edge in edges {
        if edge.id.trim().is_empty() {
            return Err("edge with empty id".to_string());
        }
        if !edge_ids.insert(edge.id.as_str()) {
            return Err(format!("duplicate edge id '{}'", edge.id));
        }
        if !node_ids.contains(edge.source.as_str()) {
            return Err(format!(
                "edge '{}' source '{}' is not a node",
                edge.id, edge.source
            ));
        }
        if !node_ids.contains(edge.target.as_str()) {
            return Err(format!(
                "edge '{}' target '{}' is not a node",
                edge.id, edge.target
            ));
        }
    }

    Ok(())
}

/// Composes the mind-map prompt, invokes the LLM, repairs malformed JSON
/// once, persists the map and publishes it to the session.
pub struct MindMapPipeline {
    store: Arc<dyn Store>,
    invoker: Arc<dyn LlmInvoker>,
    bus: Arc<SessionBus>,
}

impl MindMapPipeline {
    pub fn new(store: Arc<dyn Store>, invoker: Arc<dyn LlmInvoker>, bus: Arc<SessionBus>) -> Self {
        Self { store, invoker, bus }
    }

    /// Run the pipeline over the session's current transcript corpus.
    #[instrument(skip(self, settings), fields(model = %settings.mind_map_model))]
    pub async fn run(
        &self,
        session_id: &str,
        settings: &EffectiveSettings,
    ) -> Result<MindMapRun> {
        let corpus = load_corpus(&self.store, session_id).await?;
        let prompt = Prompts::compose(&settings.mind_map_prompt, session_id, &corpus.text);

        let started = Instant::now();
        let raw = self
            .invoker
            .invoke(&settings.mind_map_model, &prompt)
            .await?;

        let (nodes, edges) = match parse_response(&raw) {
            Ok(graph) => graph,
            Err(reason) => {
                warn!(
                    "Mind map response for session {} invalid ({}), attempting repair",
                    session_id, reason
                );
                let repair_prompt = Prompts::compose_repair(&reason, &raw);
                let repaired = self
                    .invoker
                    .invoke(&settings.mind_map_model, &repair_prompt)
                    .await?;
                parse_response(&repaired).map_err(|reason| SamtaleError::InvalidMindMap {
                    reason,
                    raw: repaired,
                })?
            }
        };

        let processing_time = started.elapsed().as_secs_f64();
        let mind_map = self
            .store
            .insert_mind_map(session_id, &nodes, &edges, &settings.mind_map_model)
            .await?;

        info!(
            "Mind map for session {} completed in {:.2}s ({} nodes, {} edges)",
            session_id,
            processing_time,
            mind_map.nodes.len(),
            mind_map.edges.len()
        );

        self.bus.publish(
            session_id,
            SessionEvent::MindMapResult(MindMapResult {
                session_id: session_id.to_string(),
                mind_map_id: mind_map.id,
                nodes: mind_map.nodes.clone(),
                edges: mind_map.edges.clone(),
            }),
        );

        Ok(MindMapRun {
            mind_map,
            max_transcript_id: corpus.max_transcript_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const VALID_GRAPH: &str =
        r#"{"nodes":[{"id":"a","label":"Alpha"},{"id":"b","label":"Beta"}],"edges":[{"id":"e1","source":"a","target":"b"}]}"#;

    struct ScriptedInvoker {
        responses: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedInvoker {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl LlmInvoker for ScriptedInvoker {
        async fn invoke(&self, _model: &str, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            responses
                .pop()
                .ok_or_else(|| SamtaleError::Llm("no scripted response left".to_string()))
        }
    }

    fn settings() -> EffectiveSettings {
        EffectiveSettings {
            whisper_language: "auto".to_string(),
            whisper_model: "base".to_string(),
            summary_model: "test-model".to_string(),
            mind_map_model: "test-model".to_string(),
            summary_prompt: "Summarize: {transcript}".to_string(),
            mind_map_prompt: "Map: {transcript}".to_string(),
            frame_length_ms: 500,
            frames_per_batch: 10,
        }
    }

    async fn seeded_store() -> Arc<dyn Store> {
        let store: Arc<dyn Store> = Arc::new(crate::store::SqliteStore::in_memory().unwrap());
        store.ensure_session("s1").await.unwrap();
        store
            .insert_transcript("s1", "hello world", None, None)
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_extract_plain_object() {
        assert_eq!(extract_json_object(r#"{"a":1}"#), Some(r#"{"a":1}"#));
    }

    #[test]
    fn test_extract_with_surrounding_prose() {
        let raw = format!("Sure! Here is your mind map:\n{}\nHope it helps.", VALID_GRAPH);
        assert_eq!(extract_json_object(&raw), Some(VALID_GRAPH));
    }

    #[test]
    fn test_extract_picks_largest_block() {
        let raw = r#"{"small":1} and then {"larger":{"nested":true}}"#;
        assert_eq!(
            extract_json_object(raw),
            Some(r#"{"larger":{"nested":true}}"#)
        );
    }

    #[test]
    fn test_extract_ignores_braces_in_strings() {
        let raw = r#"{"label":"curly } inside","n":1}"#;
        assert_eq!(extract_json_object(raw), Some(raw));
    }

    #[test]
    fn test_extract_unbalanced_returns_none() {
        assert_eq!(extract_json_object(r#"{"a": [1, 2"#), None);
        assert_eq!(extract_json_object("no braces at all"), None);
    }

    #[test]
    fn test_validate_rejects_duplicate_node_ids() {
        let raw = r#"{"nodes":[{"id":"a","label":"A"},{"id":"a","label":"B"}],"edges":[]}"#;
        let err = parse_response(raw).unwrap_err();
        assert!(err.contains("duplicate node id"));
    }

    #[test]
    fn test_validate_rejects_dangling_edge() {
        let raw =
            r#"{"nodes":[{"id":"a","label":"A"}],"edges":[{"id":"e1","source":"a","target":"ghost"}]}"#;
        let err = parse_response(raw).unwrap_err();
        assert!(err.contains("target 'ghost'"));
    }

    #[test]
    fn test_validate_rejects_empty_label() {
        let raw = r#"{"nodes":[{"id":"a","label":" "}],"edges":[]}"#;
        let err = parse_response(raw).unwrap_err();
        assert!(err.contains("empty label"));
    }

    #[tokio::test]
    async fn test_prose_wrapped_response_needs_no_repair() {
        let store = seeded_store().await;
        let invoker = ScriptedInvoker::new(&[&format!("Sure! {}", VALID_GRAPH)]);
        let pipeline =
            MindMapPipeline::new(store.clone(), invoker.clone(), Arc::new(SessionBus::new()));

        let run = pipeline.run("s1", &settings()).await.unwrap();
        assert_eq!(run.mind_map.nodes.len(), 2);
        assert_eq!(invoker.call_count(), 1);

        let maps = store.list_mind_maps("s1").await.unwrap();
        assert_eq!(maps.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_response_repaired_once() {
        let store = seeded_store().await;
        let invoker = ScriptedInvoker::new(&[r#"{"nodes": [{"id": "a", "#, VALID_GRAPH]);
        let pipeline =
            MindMapPipeline::new(store.clone(), invoker.clone(), Arc::new(SessionBus::new()));

        let run = pipeline.run("s1", &settings()).await.unwrap();
        assert_eq!(run.mind_map.edges.len(), 1);
        // exactly two invocations: the original and the single repair
        assert_eq!(invoker.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_repair_surfaces_raw_and_persists_nothing() {
        let store = seeded_store().await;
        let invoker = ScriptedInvoker::new(&["not json", "still not json"]);
        let pipeline =
            MindMapPipeline::new(store.clone(), invoker.clone(), Arc::new(SessionBus::new()));

        let err = pipeline.run("s1", &settings()).await.unwrap_err();
        match err {
            SamtaleError::InvalidMindMap { raw, .. } => assert_eq!(raw, "still not json"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(invoker.call_count(), 2);
        assert!(store.list_mind_maps("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publishes_result_event() {
        let store = seeded_store().await;
        let bus = Arc::new(SessionBus::new());
        let mut rx = bus.subscribe("s1");

        let invoker = ScriptedInvoker::new(&[VALID_GRAPH]);
        let pipeline = MindMapPipeline::new(store, invoker, bus.clone());
        pipeline.run("s1", &settings()).await.unwrap();

        match rx.recv().await.unwrap() {
            SessionEvent::MindMapResult(result) => {
                assert_eq!(result.session_id, "s1");
                assert_eq!(result.nodes.len(), 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
