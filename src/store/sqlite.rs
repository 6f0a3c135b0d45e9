//! SQLite-based session store implementation.
//!
//! A single connection behind a mutex is sufficient here: every statement is
//! short and the store is the serialization point for writes.

use super::{
    Analysis, MindMap, MindMapEdge, MindMapNode, Session, SettingsUpdate, Store, StoredSettings,
    Transcript,
};
use crate::error::{Result, SamtaleError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        name TEXT,
        created_at TEXT NOT NULL,
        last_activity TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS transcripts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        text TEXT NOT NULL,
        language TEXT,
        model TEXT,
        created_at TEXT NOT NULL,
        processed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_transcripts_session_id ON transcripts(session_id);

    CREATE TABLE IF NOT EXISTS analyses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        prompt TEXT NOT NULL,
        response TEXT NOT NULL,
        model TEXT NOT NULL,
        processing_time REAL NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_analyses_session_id ON analyses(session_id);

    CREATE TABLE IF NOT EXISTS mind_maps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        nodes_json TEXT NOT NULL,
        edges_json TEXT NOT NULL,
        model TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_mind_maps_session_id ON mind_maps(session_id);

    CREATE TABLE IF NOT EXISTS settings (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        whisper_language TEXT NOT NULL,
        whisper_model TEXT NOT NULL,
        summary_model TEXT NOT NULL,
        mind_map_model TEXT NOT NULL,
        summary_prompt TEXT NOT NULL,
        mind_map_prompt TEXT NOT NULL,
        frame_length_ms INTEGER NOT NULL,
        frames_per_batch INTEGER NOT NULL,
        active_session_id TEXT
    );
"#;

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        info!("Initialized SQLite store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SamtaleError::Store(format!("Failed to acquire lock: {}", e)))
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
        let created: String = row.get(2)?;
        let activity: String = row.get(3)?;
        Ok(Session {
            id: row.get(0)?,
            name: row.get(1)?,
            created_at: Self::parse_ts(&created),
            last_activity: Self::parse_ts(&activity),
            is_active: row.get::<_, i64>(4)? != 0,
        })
    }

    fn row_to_transcript(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transcript> {
        let created: String = row.get(5)?;
        let processed: Option<String> = row.get(6)?;
        Ok(Transcript {
            id: row.get(0)?,
            session_id: row.get(1)?,
            text: row.get(2)?,
            language: row.get(3)?,
            model: row.get(4)?,
            created_at: Self::parse_ts(&created),
            processed_at: processed.as_deref().map(Self::parse_ts),
        })
    }

    fn row_to_analysis(row: &rusqlite::Row<'_>) -> rusqlite::Result<Analysis> {
        let created: String = row.get(6)?;
        Ok(Analysis {
            id: row.get(0)?,
            session_id: row.get(1)?,
            prompt: row.get(2)?,
            response: row.get(3)?,
            model: row.get(4)?,
            processing_time: row.get(5)?,
            created_at: Self::parse_ts(&created),
        })
    }

    fn get_session_sync(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
        let session = conn
            .query_row(
                "SELECT id, name, created_at, last_activity, is_active FROM sessions WHERE id = ?1",
                params![session_id],
                Self::row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    fn settings_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSettings> {
        Ok(StoredSettings {
            whisper_language: row.get(0)?,
            whisper_model: row.get(1)?,
            summary_model: row.get(2)?,
            mind_map_model: row.get(3)?,
            summary_prompt: row.get(4)?,
            mind_map_prompt: row.get(5)?,
            frame_length_ms: row.get::<_, i64>(6)? as u32,
            frames_per_batch: row.get::<_, i64>(7)? as u32,
            active_session_id: row.get(8)?,
        })
    }

    fn load_settings_sync(conn: &Connection) -> Result<StoredSettings> {
        let existing = conn
            .query_row(
                "SELECT whisper_language, whisper_model, summary_model, mind_map_model,
                        summary_prompt, mind_map_prompt, frame_length_ms, frames_per_batch,
                        active_session_id
                 FROM settings WHERE id = 1",
                [],
                Self::settings_from_row,
            )
            .optional()?;

        if let Some(settings) = existing {
            return Ok(settings);
        }

        let defaults = StoredSettings::default();
        conn.execute(
            "INSERT INTO settings
             (id, whisper_language, whisper_model, summary_model, mind_map_model,
              summary_prompt, mind_map_prompt, frame_length_ms, frames_per_batch,
              active_session_id)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                defaults.whisper_language,
                defaults.whisper_model,
                defaults.summary_model,
                defaults.mind_map_model,
                defaults.summary_prompt,
                defaults.mind_map_prompt,
                defaults.frame_length_ms as i64,
                defaults.frames_per_batch as i64,
                defaults.active_session_id,
            ],
        )?;
        debug!("Seeded default settings row");
        Ok(defaults)
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self))]
    async fn ensure_session(&self, session_id: &str) -> Result<Session> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        if Self::get_session_sync(&conn, session_id)?.is_some() {
            conn.execute(
                "UPDATE sessions SET is_active = 1, last_activity = ?1 WHERE id = ?2",
                params![now, session_id],
            )?;
        } else {
            conn.execute(
                "INSERT INTO sessions (id, name, created_at, last_activity, is_active)
                 VALUES (?1, NULL, ?2, ?2, 1)",
                params![session_id, now],
            )?;
            info!("Created session {}", session_id);
        }

        Self::get_session_sync(&conn, session_id)?
            .ok_or_else(|| SamtaleError::SessionNotFound(session_id.to_string()))
    }

    #[instrument(skip(self))]
    async fn create_session(&self, session_id: &str, name: Option<&str>) -> Result<Session> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO sessions (id, name, created_at, last_activity, is_active)
             VALUES (?1, ?2, ?3, ?3, 1)",
            params![session_id, name, now],
        )?;

        Self::get_session_sync(&conn, session_id)?
            .ok_or_else(|| SamtaleError::SessionNotFound(session_id.to_string()))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.lock()?;
        Self::get_session_sync(&conn, session_id)
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, created_at, last_activity, is_active
             FROM sessions ORDER BY last_activity DESC",
        )?;
        let sessions = stmt
            .query_map([], Self::row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    #[instrument(skip(self))]
    async fn rename_session(&self, session_id: &str, name: &str) -> Result<Session> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sessions SET name = ?1 WHERE id = ?2",
            params![name, session_id],
        )?;
        if changed == 0 {
            return Err(SamtaleError::SessionNotFound(session_id.to_string()));
        }
        Self::get_session_sync(&conn, session_id)?
            .ok_or_else(|| SamtaleError::SessionNotFound(session_id.to_string()))
    }

    async fn set_session_active(&self, session_id: &str, active: bool) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sessions SET is_active = ?1, last_activity = ?2 WHERE id = ?3",
            params![active as i64, Utc::now().to_rfc3339(), session_id],
        )?;
        if changed == 0 {
            return Err(SamtaleError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn touch_session(&self, session_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions SET last_activity = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), session_id],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        if deleted == 0 {
            return Err(SamtaleError::SessionNotFound(session_id.to_string()));
        }
        info!("Deleted session {}", session_id);
        Ok(())
    }

    async fn clear_sessions(&self) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM sessions", [])?;
        info!("Cleared {} sessions", deleted);
        Ok(deleted)
    }

    #[instrument(skip(self, text))]
    async fn insert_transcript(
        &self,
        session_id: &str,
        text: &str,
        language: Option<&str>,
        model: Option<&str>,
    ) -> Result<Transcript> {
        let conn = self.lock()?;

        if Self::get_session_sync(&conn, session_id)?.is_none() {
            return Err(SamtaleError::SessionNotFound(session_id.to_string()));
        }

        conn.execute(
            "INSERT INTO transcripts (session_id, text, language, model, created_at, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![session_id, text, language, model, Utc::now().to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();

        let transcript = conn.query_row(
            "SELECT id, session_id, text, language, model, created_at, processed_at
             FROM transcripts WHERE id = ?1",
            params![id],
            Self::row_to_transcript,
        )?;
        debug!("Inserted transcript {} for session {}", id, session_id);
        Ok(transcript)
    }

    async fn list_transcripts(&self, session_id: &str) -> Result<Vec<Transcript>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, text, language, model, created_at, processed_at
             FROM transcripts WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let transcripts = stmt
            .query_map(params![session_id], Self::row_to_transcript)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(transcripts)
    }

    async fn mark_transcripts_processed(&self, session_id: &str, up_to_id: i64) -> Result<usize> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE transcripts SET processed_at = ?1
             WHERE session_id = ?2 AND id <= ?3 AND processed_at IS NULL",
            params![Utc::now().to_rfc3339(), session_id, up_to_id],
        )?;
        Ok(changed)
    }

    #[instrument(skip(self, prompt, response))]
    async fn insert_analysis(
        &self,
        session_id: &str,
        prompt: &str,
        response: &str,
        model: &str,
        processing_time: f64,
    ) -> Result<Analysis> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO analyses (session_id, prompt, response, model, processing_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                prompt,
                response,
                model,
                processing_time,
                Utc::now().to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();

        let analysis = conn.query_row(
            "SELECT id, session_id, prompt, response, model, processing_time, created_at
             FROM analyses WHERE id = ?1",
            params![id],
            Self::row_to_analysis,
        )?;
        debug!("Inserted analysis {} for session {}", id, session_id);
        Ok(analysis)
    }

    async fn list_analyses(&self, session_id: &str) -> Result<Vec<Analysis>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, prompt, response, model, processing_time, created_at
             FROM analyses WHERE session_id = ?1 ORDER BY id DESC",
        )?;
        let analyses = stmt
            .query_map(params![session_id], Self::row_to_analysis)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(analyses)
    }

    #[instrument(skip(self, nodes, edges))]
    async fn insert_mind_map(
        &self,
        session_id: &str,
        nodes: &[MindMapNode],
        edges: &[MindMapEdge],
        model: &str,
    ) -> Result<MindMap> {
        let nodes_json = serde_json::to_string(nodes)?;
        let edges_json = serde_json::to_string(edges)?;

        let conn = self.lock()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO mind_maps (session_id, nodes_json, edges_json, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, nodes_json, edges_json, model, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Inserted mind map {} for session {}", id, session_id);

        Ok(MindMap {
            id,
            session_id: session_id.to_string(),
            nodes: nodes.to_vec(),
            edges: edges.to_vec(),
            model: model.to_string(),
            created_at: now,
        })
    }

    async fn list_mind_maps(&self, session_id: &str) -> Result<Vec<MindMap>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, nodes_json, edges_json, model, created_at
             FROM mind_maps WHERE session_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let nodes_json: String = row.get(2)?;
                let edges_json: String = row.get(3)?;
                let created: String = row.get(5)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    nodes_json,
                    edges_json,
                    row.get::<_, String>(4)?,
                    created,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut maps = Vec::with_capacity(rows.len());
        for (id, session_id, nodes_json, edges_json, model, created) in rows {
            maps.push(MindMap {
                id,
                session_id,
                nodes: serde_json::from_str(&nodes_json)?,
                edges: serde_json::from_str(&edges_json)?,
                model,
                created_at: Self::parse_ts(&created),
            });
        }
        Ok(maps)
    }

    async fn load_settings(&self) -> Result<StoredSettings> {
        let conn = self.lock()?;
        Self::load_settings_sync(&conn)
    }

    #[instrument(skip(self, update))]
    async fn update_settings(&self, update: &SettingsUpdate) -> Result<StoredSettings> {
        let conn = self.lock()?;
        let mut settings = Self::load_settings_sync(&conn)?;

        if let Some(v) = &update.whisper_language {
            settings.whisper_language = v.clone();
        }
        if let Some(v) = &update.whisper_model {
            settings.whisper_model = v.clone();
        }
        if let Some(v) = &update.summary_model {
            settings.summary_model = v.clone();
        }
        if let Some(v) = &update.mind_map_model {
            settings.mind_map_model = v.clone();
        }
        if let Some(v) = &update.summary_prompt {
            settings.summary_prompt = v.clone();
        }
        if let Some(v) = &update.mind_map_prompt {
            settings.mind_map_prompt = v.clone();
        }
        if let Some(v) = update.frame_length_ms {
            settings.frame_length_ms = v;
        }
        if let Some(v) = update.frames_per_batch {
            settings.frames_per_batch = v;
        }
        if let Some(v) = &update.active_session_id {
            settings.active_session_id = v.clone();
        }

        conn.execute(
            "UPDATE settings SET whisper_language = ?1, whisper_model = ?2,
                    summary_model = ?3, mind_map_model = ?4, summary_prompt = ?5,
                    mind_map_prompt = ?6, frame_length_ms = ?7, frames_per_batch = ?8,
                    active_session_id = ?9
             WHERE id = 1",
            params![
                settings.whisper_language,
                settings.whisper_model,
                settings.summary_model,
                settings.mind_map_model,
                settings.summary_prompt,
                settings.mind_map_prompt,
                settings.frame_length_ms as i64,
                settings.frames_per_batch as i64,
                settings.active_session_id,
            ],
        )?;

        Ok(settings)
    }
}
