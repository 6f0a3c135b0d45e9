//! File configuration for Samtale.
//!
//! Covers process-level knobs only: bind address, database path, model
//! endpoints, pool sizes, timeouts. Per-user tunables (model names, prompt
//! templates, frame batching) live in the store's settings row and are
//! resolved through [`crate::settings::SettingsResolver`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub transcriber: TranscriberConfig,
    pub llm: LlmConfig,
    pub audio: AudioConfig,
}


/// HTTP/websocket server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8760,
            log_level: "info".to_string(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "~/.samtale/samtale.db".to_string(),
        }
    }
}

/// Speech-to-text adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    /// Base URL of the transcription API (OpenAI-compatible).
    pub api_base: String,
    /// Soft timeout for one transcription call, in seconds.
    pub timeout_seconds: u64,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:11434/v1".to_string(),
            timeout_seconds: 60,
        }
    }
}

/// LLM adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the chat-completion API (OpenAI-compatible, e.g. Ollama).
    pub api_base: String,
    /// Optional outer deadline for a pipeline's LLM call, in seconds.
    /// Zero means no deadline; models can be slow.
    pub deadline_seconds: u64,
    /// Number of LLM pipeline runs allowed to execute concurrently.
    pub pool_size: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:11434/v1".to_string(),
            deadline_seconds: 0,
            pool_size: 2,
        }
    }
}

/// Audio intake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Soft high-water mark for a session's pending transcription queue.
    /// The oldest queued unit is dropped on overflow.
    pub queue_high_water: usize,
    /// Seconds a session's transcription worker may sit idle before retiring.
    pub worker_idle_seconds: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            queue_high_water: 32,
            worker_idle_seconds: 300,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the platform config
    /// directory when none is given. A missing file yields the defaults;
    /// any other read failure is an error.
    pub fn load(path: Option<&Path>) -> crate::error::Result<Self> {
        let file = path.map_or_else(default_config_path, Path::to_path_buf);
        match std::fs::read_to_string(&file) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> crate::error::Result<()> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SamtaleError::Config(e.to_string()))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(std::fs::write(path, rendered)?)
    }

    /// Expanded SQLite database path (tilde-aware).
    pub fn sqlite_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.store.sqlite_path).into_owned())
    }
}

/// `samtale/config.toml` under the platform config directory, falling back
/// to the working directory on systems without one.
fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("samtale").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("samtale-config.toml"))
}
