//! Device-free backend that "plays" a clip by waiting out its duration on the
//! tokio clock. Used for `--dry-run` and for exercising the scheduler.
//!
//! Failures can be scripted, and every stream is recorded so callers can
//! check ordering and the one-stream-at-a-time property.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::{AudioClip, PlaybackBackend, PlaybackError, PlaybackStream, StreamId};

/// How a finished simulated stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    Ended,
    Failed(PlaybackError),
    Stopped,
}

/// One stream as seen by the simulated device.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub id: StreamId,
    pub duration: Duration,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    pub end: Option<StreamEnd>,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    live: HashMap<StreamId, JoinHandle<()>>,
    playing: usize,
    max_playing: usize,
    start_failures: VecDeque<PlaybackError>,
    play_failures: VecDeque<PlaybackError>,
    log: Vec<StreamRecord>,
}

impl SimState {
    fn close(&mut self, id: StreamId, end: StreamEnd) {
        self.playing = self.playing.saturating_sub(1);
        if let Some(record) = self.log.iter_mut().find(|r| r.id == id) {
            record.ended_at = Some(Instant::now());
            record.end = Some(end);
        }
    }
}

/// Simulated output device.
#[derive(Clone)]
pub struct SimulatedBackend {
    state: Arc<Mutex<SimState>>,
    fallback_duration: Duration,
    max_duration: Duration,
}

impl SimulatedBackend {
    /// `fallback_duration` is used for clips whose length cannot be measured.
    pub fn new(fallback_duration: Duration, max_duration: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            fallback_duration,
            max_duration,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` calls to `start` fail immediately.
    pub fn fail_next_starts(&self, count: usize, error: PlaybackError) {
        let mut state = self.lock();
        state.start_failures.extend(std::iter::repeat(error).take(count));
    }

    /// Make the next `count` streams fail when they reach their end.
    pub fn fail_next_plays(&self, count: usize, error: PlaybackError) {
        let mut state = self.lock();
        state.play_failures.extend(std::iter::repeat(error).take(count));
    }

    /// Highest number of streams ever playing at once.
    pub fn max_concurrent(&self) -> usize {
        self.lock().max_playing
    }

    pub fn playing(&self) -> usize {
        self.lock().playing
    }

    /// Every stream started so far, in start order.
    pub fn streams(&self) -> Vec<StreamRecord> {
        self.lock().log.clone()
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(120))
    }
}

impl PlaybackBackend for SimulatedBackend {
    fn start(&self, clip: &AudioClip) -> Result<PlaybackStream, PlaybackError> {
        let mut state = self.lock();
        if let Some(error) = state.start_failures.pop_front() {
            debug!("simulated start failure: {error}");
            return Err(error);
        }

        state.next_id += 1;
        let id = StreamId(state.next_id);
        let duration = clip.duration().unwrap_or(self.fallback_duration);
        let outcome = match state.play_failures.pop_front() {
            Some(error) => Err(error),
            None if duration > self.max_duration => Err(PlaybackError::Timeout(self.max_duration)),
            None => Ok(()),
        };
        let wait = duration.min(self.max_duration);

        let (done_tx, done_rx) = oneshot::channel();
        let shared = self.state.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
            // Removing the entry is what entitles this task to report
            if state.live.remove(&id).is_none() {
                return;
            }
            let end = match &outcome {
                Ok(()) => StreamEnd::Ended,
                Err(e) => StreamEnd::Failed(e.clone()),
            };
            state.close(id, end);
            let _ = done_tx.send(outcome);
        });

        state.live.insert(id, task);
        state.playing += 1;
        state.max_playing = state.max_playing.max(state.playing);
        state.log.push(StreamRecord {
            id,
            duration,
            started_at: Instant::now(),
            ended_at: None,
            end: None,
        });
        debug!("simulated {id} started ({duration:?})");

        Ok(PlaybackStream {
            id,
            duration: Some(duration),
            done: done_rx,
        })
    }

    fn stop(&self, stream: StreamId) {
        let mut state = self.lock();
        if let Some(task) = state.live.remove(&stream) {
            task.abort();
            state.close(stream, StreamEnd::Stopped);
            debug!("simulated {stream} stopped");
        }
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
