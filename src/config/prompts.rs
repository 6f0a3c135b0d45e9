//! Prompt templates for Samtale.
//!
//! The summary and mind-map templates stored in the settings row default to
//! the constants here. Templates carry a literal `{transcript}` marker that
//! pipelines substitute with the session corpus.

use serde::{Deserialize, Serialize};

/// Literal marker replaced with the session transcript corpus.
pub const TRANSCRIPT_MARKER: &str = "{transcript}";

/// Default prompt for the session summary pipeline.
pub const DEFAULT_SUMMARY_PROMPT: &str = r#"Please analyze the following transcript and provide insights:

TRANSCRIPT:
{transcript}

Please provide:
1. A brief summary of the main topics discussed
2. Key points or important information mentioned
3. Any questions, concerns, or action items identified
4. Overall sentiment or tone of the conversation

Use clear formatting with line breaks and bullet points for readability.
Be concise and use only information present in the transcript."#;

/// Default prompt for the mind-map pipeline.
pub const DEFAULT_MIND_MAP_PROMPT: &str = r#"Please analyze the following transcript and create a mind map of concepts and relationships.

TRANSCRIPT:
{transcript}

Create a mind map in JSON format with the following structure:
{
  "nodes": [
    {"id": "unique_id_1", "label": "Main Topic", "type": "topic"},
    {"id": "unique_id_2", "label": "Related Concept", "type": "concept"}
  ],
  "edges": [
    {"id": "edge_1", "source": "unique_id_1", "target": "unique_id_2", "label": "relates to", "type": "relationship"}
  ]
}

Guidelines:
- Extract key concepts, topics, entities, and ideas from the transcript
- Create meaningful relationships between concepts
- Use SHORT, CONCISE labels (max 3-4 words) so nodes fit in a graph view
- Limit to 5-8 nodes for readability
- Return ONLY valid JSON, no additional text

Return the mind map as a valid JSON object:"#;

/// Prompt used for the single mind-map JSON repair attempt.
pub const REPAIR_PROMPT: &str = r#"The following response was supposed to be a JSON object with "nodes" and "edges" arrays but could not be used.

ERROR DETAILS:
{error_details}

INVALID RESPONSE:
{invalid_json}

Please return ONLY the corrected JSON object without any additional text or explanations:"#;

/// Prompt template pair used when seeding the settings row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompts {
    pub summary: String,
    pub mind_map: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            summary: DEFAULT_SUMMARY_PROMPT.to_string(),
            mind_map: DEFAULT_MIND_MAP_PROMPT.to_string(),
        }
    }
}

impl Prompts {
    /// Substitute the `{transcript}` marker in a template with the session
    /// context: a `SESSION ID:` header followed by the full corpus.
    ///
    /// If the marker is absent, the context is appended on a new line so a
    /// user-edited template can never silently drop the transcript.
    pub fn compose(template: &str, session_id: &str, corpus: &str) -> String {
        let context = format!(
            "SESSION ID: {}\nCOMPLETE SESSION TRANSCRIPT:\n{}",
            session_id, corpus
        );
        if template.contains(TRANSCRIPT_MARKER) {
            template.replace(TRANSCRIPT_MARKER, &context)
        } else {
            format!("{}\n{}", template, context)
        }
    }

    /// Build the repair prompt quoting the offending raw output.
    pub fn compose_repair(error_details: &str, invalid: &str) -> String {
        REPAIR_PROMPT
            .replace("{error_details}", error_details)
            .replace("{invalid_json}", invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_with_marker() {
        let out = Prompts::compose("Summarize: {transcript}!", "s1", "hello world");
        assert_eq!(
            out,
            "Summarize: SESSION ID: s1\nCOMPLETE SESSION TRANSCRIPT:\nhello world!"
        );
    }

    #[test]
    fn test_compose_without_marker() {
        let out = Prompts::compose("Summarize the following.", "s1", "hello world");
        assert_eq!(
            out,
            "Summarize the following.\nSESSION ID: s1\nCOMPLETE SESSION TRANSCRIPT:\nhello world"
        );
    }

    #[test]
    fn test_default_templates_carry_marker() {
        assert!(DEFAULT_SUMMARY_PROMPT.contains(TRANSCRIPT_MARKER));
        assert!(DEFAULT_MIND_MAP_PROMPT.contains(TRANSCRIPT_MARKER));
    }
}
