//! Audio intake: validation, batching, and per-session queueing.
//!
//! Frames from one client arrive already batched to the configured duration;
//! the intake accumulates `frames_per_batch` of them, merges the PCM into a
//! single WAV unit, and queues the unit for the session's transcription
//! worker. The queue never blocks the inbound socket reader: at the soft
//! high-water mark the oldest queued unit is dropped instead.

use crate::audio::{self, WavInfo};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// One merged audio unit awaiting transcription.
#[derive(Debug, Clone)]
pub struct FrameUnit {
    pub session_id: String,
    pub bytes: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Outcome of accepting one client frame.
#[derive(Debug, Clone, Copy)]
pub struct AcceptedFrame {
    /// RMS level of the frame's PCM payload, 0-100.
    pub audio_level: u8,
    /// Whether this frame completed a batch and enqueued a unit.
    pub enqueued_unit: bool,
    /// Whether enqueueing dropped the oldest queued unit.
    pub dropped_oldest: bool,
}

#[derive(Default)]
struct SessionIntake {
    /// Frames accumulating toward the next transcription unit.
    batch: Vec<(Vec<u8>, WavInfo)>,
    /// Merged units pending transcription, oldest first.
    queue: VecDeque<FrameUnit>,
}

struct SessionState {
    inner: Mutex<SessionIntake>,
    notify: Notify,
}

impl SessionState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SessionIntake::default()),
            notify: Notify::new(),
        }
    }
}

/// Validates and enqueues framed audio units per session.
pub struct AudioIntake {
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
    high_water: usize,
}

impl AudioIntake {
    pub fn new(high_water: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            high_water: high_water.max(1),
        }
    }

    fn session(&self, session_id: &str) -> Arc<SessionState> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionState::new()))
            .clone()
    }

    /// Validate a frame and add it to the session's batch. When the batch
    /// reaches `frames_per_batch`, the merged unit is queued for
    /// transcription. Malformed frames fail with `InvalidFrame` and leave
    /// the session untouched.
    pub fn accept_frame(
        &self,
        session_id: &str,
        bytes: Vec<u8>,
        frames_per_batch: u32,
    ) -> Result<AcceptedFrame> {
        let info = audio::validate_frame(&bytes)?;
        let audio_level =
            audio::rms_level(&bytes[info.data_offset..info.data_offset + info.data_len]);

        let state = self.session(session_id);
        let mut intake = state.inner.lock().unwrap_or_else(|e| e.into_inner());

        intake.batch.push((bytes, info));

        let mut accepted = AcceptedFrame {
            audio_level,
            enqueued_unit: false,
            dropped_oldest: false,
        };

        if intake.batch.len() >= frames_per_batch.max(1) as usize {
            accepted.dropped_oldest = Self::enqueue_batch(session_id, &mut intake, self.high_water)?;
            accepted.enqueued_unit = true;
            drop(intake);
            state.notify.notify_one();
        }

        Ok(accepted)
    }

    /// Merge and enqueue any partial batch. Called on `stop_stream` so a
    /// trailing sub-batch is not lost. Returns true when a unit was queued.
    pub fn flush(&self, session_id: &str) -> Result<bool> {
        let state = self.session(session_id);
        let mut intake = state.inner.lock().unwrap_or_else(|e| e.into_inner());

        if intake.batch.is_empty() {
            return Ok(false);
        }

        let dropped = Self::enqueue_batch(session_id, &mut intake, self.high_water)?;
        if dropped {
            warn!("Flush dropped oldest queued unit for session {}", session_id);
        }
        drop(intake);
        state.notify.notify_one();
        Ok(true)
    }

    fn enqueue_batch(
        session_id: &str,
        intake: &mut SessionIntake,
        high_water: usize,
    ) -> Result<bool> {
        let frames = std::mem::take(&mut intake.batch);
        let merged = audio::merge_frames(&frames)?;
        intake.queue.push_back(FrameUnit {
            session_id: session_id.to_string(),
            bytes: merged,
            received_at: Utc::now(),
        });

        let mut dropped = false;
        while intake.queue.len() > high_water {
            intake.queue.pop_front();
            dropped = true;
        }
        if dropped {
            warn!(
                "Intake queue overflow for session {}, dropped oldest unit",
                session_id
            );
        }
        debug!(
            "Queued unit for session {} (depth {})",
            session_id,
            intake.queue.len()
        );
        Ok(dropped)
    }

    /// Await the next queued unit for a session. Units are delivered in
    /// arrival order.
    pub async fn pop(&self, session_id: &str) -> FrameUnit {
        let state = self.session(session_id);
        loop {
            let notified = state.notify.notified();
            {
                let mut intake = state.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(unit) = intake.queue.pop_front() {
                    return unit;
                }
            }
            notified.await;
        }
    }

    /// Pending unit count for a session.
    pub fn queue_depth(&self, session_id: &str) -> usize {
        let state = self.session(session_id);
        let intake = state.inner.lock().unwrap_or_else(|e| e.into_inner());
        intake.queue.len()
    }

    /// Drop a session's intake state. Used when a worker retires idle.
    pub fn remove_session(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = sessions.get(session_id) {
            let intake = state.inner.lock().unwrap_or_else(|e| e.into_inner());
            if intake.queue.is_empty() && intake.batch.is_empty() {
                drop(intake);
                sessions.remove(session_id);
                debug!("Removed intake state for session {}", session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::make_test_wav;
    use crate::error::SamtaleError;

    fn frame(marker: i16) -> Vec<u8> {
        make_test_wav(16_000, 1, &[marker; 160])
    }

    #[test]
    fn test_rejects_malformed_frame() {
        let intake = AudioIntake::new(8);
        let err = intake
            .accept_frame("s1", vec![0u8; 10], 1)
            .unwrap_err();
        assert!(matches!(err, SamtaleError::InvalidFrame(_)));
        assert_eq!(intake.queue_depth("s1"), 0);
    }

    #[test]
    fn test_batching_enqueues_after_n_frames() {
        let intake = AudioIntake::new(8);

        let first = intake.accept_frame("s1", frame(1), 3).unwrap();
        let second = intake.accept_frame("s1", frame(2), 3).unwrap();
        assert!(!first.enqueued_unit);
        assert!(!second.enqueued_unit);
        assert_eq!(intake.queue_depth("s1"), 0);

        let third = intake.accept_frame("s1", frame(3), 3).unwrap();
        assert!(third.enqueued_unit);
        assert_eq!(intake.queue_depth("s1"), 1);
    }

    #[test]
    fn test_flush_partial_batch() {
        let intake = AudioIntake::new(8);

        intake.accept_frame("s1", frame(1), 10).unwrap();
        assert_eq!(intake.queue_depth("s1"), 0);

        assert!(intake.flush("s1").unwrap());
        assert_eq!(intake.queue_depth("s1"), 1);

        // nothing left to flush
        assert!(!intake.flush("s1").unwrap());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let intake = AudioIntake::new(2);

        intake.accept_frame("s1", frame(1), 1).unwrap();
        let second = intake.accept_frame("s1", frame(2), 1).unwrap();
        assert!(!second.dropped_oldest);

        let third = intake.accept_frame("s1", frame(3), 1).unwrap();
        assert!(third.dropped_oldest);
        assert_eq!(intake.queue_depth("s1"), 2);
    }

    #[tokio::test]
    async fn test_pop_delivers_in_arrival_order() {
        let intake = AudioIntake::new(8);

        intake.accept_frame("s1", frame(10), 1).unwrap();
        intake.accept_frame("s1", frame(20), 1).unwrap();

        let first = intake.pop("s1").await;
        let second = intake.pop("s1").await;
        assert!(first.received_at <= second.received_at);

        // payloads stay distinct per unit
        assert_ne!(first.bytes, second.bytes);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_new_unit() {
        let intake = Arc::new(AudioIntake::new(8));

        let popper = {
            let intake = intake.clone();
            tokio::spawn(async move { intake.pop("s1").await })
        };

        tokio::task::yield_now().await;
        intake.accept_frame("s1", frame(1), 1).unwrap();

        let unit = tokio::time::timeout(std::time::Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unit.session_id, "s1");
    }

    #[test]
    fn test_sessions_do_not_interfere() {
        let intake = AudioIntake::new(8);

        intake.accept_frame("s1", frame(1), 1).unwrap();
        assert_eq!(intake.queue_depth("s1"), 1);
        assert_eq!(intake.queue_depth("s2"), 0);
    }
}
