//! Samtale - Real-time Voice Session Analysis
//!
//! A server that accepts streamed microphone audio over a websocket,
//! transcribes it, and derives two LLM artifacts per session as transcripts
//! accumulate: a textual analysis and a structured mind map. Results stream
//! back to connected clients as the session progresses.
//!
//! The name "Samtale" comes from the Norwegian word for "conversation."
//!
//! # Architecture
//!
//! - `config` - File configuration and prompt templates
//! - `store` - SQLite persistence for sessions, transcripts, analyses, mind maps
//! - `settings` - Effective-settings resolution with temporary overrides
//! - `audio` - WAV frame validation and PCM utilities
//! - `intake` - Per-session audio frame batching and queueing
//! - `transcription` - Speech-to-text abstraction
//! - `llm` - Chat-completion abstraction
//! - `worker` - Per-session transcription workers
//! - `processing` - Per-session, per-operation mutual exclusion
//! - `pipeline` - Summary and mind-map LLM pipelines
//! - `bus` - Per-session event fan-out
//! - `orchestrator` - Pipeline triggering and lifecycle
//! - `server` - Websocket transport and HTTP API

pub mod audio;
pub mod bus;
pub mod config;
pub mod error;
pub mod intake;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod processing;
pub mod server;
pub mod settings;
pub mod store;
pub mod transcription;
pub mod worker;

pub use error::{Result, SamtaleError};
