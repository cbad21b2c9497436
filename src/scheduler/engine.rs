//! Scheduler core: the single authority over what plays now and what plays
//! next.
//!
//! All shared state sits behind one mutex that is never held across an
//! `.await`. Submitters only take it for placement; one worker task pops the
//! queue, drives the backend and resolves outcomes. Cancelling the active
//! request (preemption, shutdown) also happens under the lock: the backend
//! stream is stopped first, then the slot's token is cancelled, so the worker
//! can never attribute a stale completion to the wrong request.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::notifier::{CompletionNotifier, SpeechHandle, SpeechResult};
use super::policy::{PolicyMode, RetryPlacement};
use super::request::{
    AudioRequest, Completion, Outcome, Payload, RequestId, RequestState, DEFAULT_PRIORITY,
};
use crate::backend::{PlaybackBackend, PlaybackError, PlaybackStream, StreamId};
use crate::config::SchedulerConfig;
use crate::error::{CancelReason, SpeechError};
use crate::events::{EventBus, SpeechEvent};
use crate::synth::{Synthesized, Synthesizer, VisemeCue};

/// Consecutive failed attempts after which the scheduler reports itself degraded.
const DEGRADED_AFTER: u64 = 3;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub mode: PolicyMode,
    pub max_retries: u32,
    /// Gap between one item ending and the next starting.
    pub inter_item_delay: Duration,
    /// How long finished requests stay available to `lookup`.
    pub completed_retention: Duration,
    pub retry_placement: RetryPlacement,
    pub event_capacity: usize,
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            mode: config.mode,
            max_retries: config.max_retries,
            inter_item_delay: Duration::from_millis(config.inter_item_delay_ms),
            completed_retention: Duration::from_secs(config.completed_retention_secs),
            retry_placement: config.retry_placement,
            event_capacity: config.event_capacity,
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// Monotonic counters; reset only by restarting the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub completed: u64,
    /// Submissions that found the device busy or the queue non-empty.
    pub queued: u64,
    /// Active requests stopped by preemption.
    pub interrupted: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    /// Failed attempts since the last success (a gauge, not a counter).
    pub consecutive_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub is_playing: bool,
    pub current_id: Option<RequestId>,
    pub current_source: Option<String>,
    pub queue_length: usize,
    pub mode: PolicyMode,
    pub degraded: bool,
    pub stats: SchedulerStats,
}

struct ActiveSlot {
    id: RequestId,
    source: String,
    priority: i32,
    attempt: u32,
    cancel: CancellationToken,
    stream: Option<StreamId>,
}

struct SchedulerState {
    pending: VecDeque<AudioRequest>,
    active: Option<ActiveSlot>,
    mode: PolicyMode,
    stats: SchedulerStats,
    notifier: CompletionNotifier,
    shutting_down: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Done,
    Retry,
    Cancelled,
}

struct Inner {
    state: Mutex<SchedulerState>,
    wake: Notify,
    shutdown: CancellationToken,
    backend: Arc<dyn PlaybackBackend>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    events: EventBus,
    options: SchedulerOptions,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running scheduler. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create the scheduler and spawn its worker on the current tokio runtime.
    pub fn start(
        backend: Arc<dyn PlaybackBackend>,
        synthesizer: Option<Arc<dyn Synthesizer>>,
        options: SchedulerOptions,
    ) -> Self {
        let state = SchedulerState {
            pending: VecDeque::new(),
            active: None,
            mode: options.mode,
            stats: SchedulerStats::default(),
            notifier: CompletionNotifier::new(options.completed_retention),
            shutting_down: false,
        };

        let inner = Arc::new(Inner {
            state: Mutex::new(state),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            backend,
            synthesizer,
            events: EventBus::new(options.event_capacity),
            options,
            worker: Mutex::new(None),
        });

        let worker = tokio::spawn(inner.clone().run());
        *inner.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);

        Self { inner }
    }

    /// Submit a request. Returns immediately; await the handle for the outcome.
    pub fn submit(
        &self,
        source: impl Into<String>,
        payload: Payload,
        priority: Option<i32>,
    ) -> SpeechHandle {
        let source = source.into();
        let priority = priority.unwrap_or(DEFAULT_PRIORITY);
        let id = RequestId::new();
        let inner = &self.inner;

        let mut guard = inner.lock();
        let state = &mut *guard;
        state.notifier.purge_stale(Instant::now());
        let handle = state.notifier.register(id);

        if state.shutting_down {
            inner.resolve(state, id, &source, 0, Err(SpeechError::Interrupted(CancelReason::Shutdown)));
            return handle;
        }

        if let Err(detail) = payload.validate() {
            warn!("Rejected {} request from {source}: {detail}", payload.kind());
            inner.resolve(state, id, &source, 0, Err(SpeechError::InvalidRequest(detail)));
            return handle;
        }

        // Blank text and empty audio skip both the device and the synthesizer
        if payload.is_silent() {
            debug!("Nothing to play for {source}, completing {id} immediately");
            let completion = Completion::skipped(id, source.clone());
            inner.resolve(state, id, &source, 0, Ok(completion));
            return handle;
        }

        if matches!(payload, Payload::Speech(_)) && inner.synthesizer.is_none() {
            let detail = "speech payload requires a configured synthesizer".to_string();
            warn!("Rejected speech request from {source}: {detail}");
            inner.resolve(state, id, &source, 0, Err(SpeechError::InvalidRequest(detail)));
            return handle;
        }

        state.stats.submitted += 1;
        if state.active.is_some() || !state.pending.is_empty() {
            state.stats.queued += 1;
        }

        debug!(
            id = %id,
            source = %source,
            priority,
            mode = %state.mode,
            "Admitting {} request",
            payload.kind()
        );
        let request = AudioRequest::new(id, source, payload, priority);
        let active_priority = state.active.as_ref().map(|slot| slot.priority);
        let admission = state
            .mode
            .strategy()
            .admit(&mut state.pending, active_priority, request);

        for displaced in admission.displaced {
            inner.cancel_pending(state, displaced, CancelReason::Preempted);
        }
        if admission.preempt_active {
            inner.cancel_active(state, CancelReason::Preempted);
        }

        drop(guard);
        inner.wake.notify_one();
        handle
    }

    /// Change the admission mode for later submissions. Returns false when
    /// the mode was already active.
    pub fn set_mode(&self, mode: PolicyMode) -> bool {
        let mut state = self.inner.lock();
        if state.mode == mode {
            debug!("Mode already {mode}");
            return false;
        }
        info!("Mode changed: {} → {mode}", state.mode);
        state.mode = mode;
        true
    }

    pub fn mode(&self) -> PolicyMode {
        self.inner.lock().mode
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.inner.lock();
        SchedulerStatus {
            is_playing: state.active.is_some(),
            current_id: state.active.as_ref().map(|slot| slot.id),
            current_source: state.active.as_ref().map(|slot| slot.source.clone()),
            queue_length: state.pending.len(),
            mode: state.mode,
            degraded: state.stats.consecutive_failures >= DEGRADED_AFTER,
            stats: state.stats.clone(),
        }
    }

    /// Cancel every pending request. The active one keeps playing.
    pub fn clear_queue(&self) -> usize {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let cleared: Vec<AudioRequest> = state.pending.drain(..).collect();
        let count = cleared.len();
        for request in cleared {
            self.inner.cancel_pending(state, request, CancelReason::QueueCleared);
        }
        if count > 0 {
            info!("Cleared {count} pending requests");
        }
        count
    }

    /// State of a request, while its record is retained.
    pub fn lookup(&self, id: RequestId) -> Option<RequestState> {
        let mut state = self.inner.lock();
        state.notifier.purge_stale(Instant::now());
        state.notifier.lookup(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpeechEvent> {
        self.inner.events.subscribe()
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Cancel everything, stop the worker and close the event stream. Later
    /// submissions resolve as cancelled.
    pub async fn shutdown(&self) {
        {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            self.inner.cancel_active(state, CancelReason::Shutdown);
            let pending: Vec<AudioRequest> = state.pending.drain(..).collect();
            for request in pending {
                self.inner.cancel_pending(state, request, CancelReason::Shutdown);
            }
        }

        self.inner.shutdown.cancel();
        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Speech worker ended abnormally: {e}");
            }
        }
        // Subscribers drain what was already sent, then see the stream end
        self.inner.events.close();
        info!("Scheduler shut down");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// Record a terminal outcome and broadcast it. Caller holds the lock.
    fn resolve(
        &self,
        state: &mut SchedulerState,
        id: RequestId,
        source: &str,
        retries: u32,
        result: SpeechResult,
    ) {
        let (outcome, duration_ms, detail) = match &result {
            Ok(completion) => (Outcome::Success, completion.duration_ms, None),
            Err(e) => (e.outcome(), None, Some(e.to_string())),
        };
        if state.notifier.resolve(id, result) {
            self.events.emit(SpeechEvent::Finished {
                id,
                source: source.to_string(),
                outcome,
                duration_ms,
                retries,
                detail,
            });
        }
    }

    fn cancel_pending(&self, state: &mut SchedulerState, request: AudioRequest, reason: CancelReason) {
        state.stats.cancelled += 1;
        debug!("Cancelled pending {} from {} ({reason})", request.id, request.source);
        self.resolve(
            state,
            request.id,
            &request.source,
            request.retry_count,
            Err(SpeechError::Interrupted(reason)),
        );
    }

    /// Stop the backend stream, then cancel and resolve the active request.
    fn cancel_active(&self, state: &mut SchedulerState, reason: CancelReason) {
        let Some(slot) = state.active.take() else {
            return;
        };

        if let Some(stream) = slot.stream {
            self.backend.stop(stream);
        }
        slot.cancel.cancel();

        if reason == CancelReason::Preempted {
            state.stats.interrupted += 1;
        }
        state.stats.cancelled += 1;
        info!("Stopped {} from {} ({reason})", slot.id, slot.source);
        self.resolve(
            state,
            slot.id,
            &slot.source,
            slot.attempt.saturating_sub(1),
            Err(SpeechError::Interrupted(reason)),
        );
    }

    fn activate_next(&self, state: &mut SchedulerState) -> Option<(AudioRequest, CancellationToken)> {
        let request = state.pending.pop_front()?;
        let cancel = CancellationToken::new();
        state.active = Some(ActiveSlot {
            id: request.id,
            source: request.source.clone(),
            priority: request.priority,
            attempt: request.retry_count + 1,
            cancel: cancel.clone(),
            stream: None,
        });
        state.notifier.set_active(request.id, true);
        debug!(
            id = %request.id,
            source = %request.source,
            attempt = request.retry_count + 1,
            waited_ms = request.submitted_at.elapsed().as_millis() as u64,
            "Request active"
        );
        Some((request, cancel))
    }

    async fn run(self: Arc<Self>) {
        info!("Speech worker started (backend: {})", self.backend.name());
        loop {
            let next = {
                let mut state = self.lock();
                if state.shutting_down {
                    break;
                }
                self.activate_next(&mut state)
            };

            let (request, cancel) = match next {
                Some(item) => item,
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                    continue;
                }
            };

            let step = self.play(request, cancel).await;

            // A preempting request starts right away; anything else gets a gap
            let delay = self.options.inter_item_delay;
            if step != Step::Cancelled && !delay.is_zero() && self.has_pending() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => break,
                }
            }
        }
        info!("Speech worker stopped");
    }

    /// One attempt at the active request.
    async fn play(&self, mut request: AudioRequest, cancel: CancellationToken) -> Step {
        let rendered = match self.render(&mut request, &cancel).await {
            Ok(Some(rendered)) => rendered,
            Ok(None) => return Step::Cancelled,
            Err(e) => return self.fail(request, &cancel, e),
        };

        if rendered.clip.is_empty() {
            debug!("Synthesis produced no audio for {}", request.id);
            return self.succeed(request, &cancel, Some(0), rendered.visemes);
        }

        let PlaybackStream {
            id: stream_id,
            duration,
            done,
        } = match self.backend.start(&rendered.clip) {
            Ok(stream) => stream,
            Err(e) => return self.fail(request, &cancel, e),
        };
        let duration_ms = duration.map(|d| d.as_millis() as u64);

        {
            let mut state = self.lock();
            if cancel.is_cancelled() {
                // Cancelled while starting: the slot never knew this stream
                self.backend.stop(stream_id);
                return Step::Cancelled;
            }
            if let Some(slot) = state.active.as_mut() {
                slot.stream = Some(stream_id);
            }
            self.events.emit(SpeechEvent::Started {
                id: request.id,
                source: request.source.clone(),
                attempt: request.retry_count + 1,
                duration_ms,
                visemes: rendered.visemes.clone(),
            });
        }
        debug!("{} playing {} for {}", self.backend.name(), stream_id, request.source);

        let ended = tokio::select! {
            _ = cancel.cancelled() => return Step::Cancelled,
            ended = done => ended,
        };

        match ended {
            Ok(Ok(())) => self.succeed(request, &cancel, duration_ms, rendered.visemes),
            Ok(Err(e)) => self.fail(request, &cancel, e),
            Err(_) => self.fail(
                request,
                &cancel,
                PlaybackError::Device(format!("{stream_id} closed without reporting")),
            ),
        }
    }

    /// Audio for the request, synthesizing it on first use. `None` if
    /// cancelled meanwhile.
    async fn render(
        &self,
        request: &mut AudioRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Synthesized>, PlaybackError> {
        let speech = match &request.payload {
            Payload::Audio(clip) => {
                return Ok(Some(Synthesized {
                    clip: clip.clone(),
                    visemes: Vec::new(),
                }))
            }
            Payload::Speech(speech) => speech.clone(),
        };

        if let Some(rendered) = &request.rendered {
            return Ok(Some(rendered.clone()));
        }

        let synthesizer = self
            .synthesizer
            .clone()
            .ok_or_else(|| PlaybackError::Synthesis("no synthesizer configured".into()))?;

        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            result = synthesizer.synthesize(&speech) => {
                let synthesized = result?;
                request.rendered = Some(synthesized.clone());
                Ok(Some(synthesized))
            }
        }
    }

    fn succeed(
        &self,
        request: AudioRequest,
        cancel: &CancellationToken,
        duration_ms: Option<u64>,
        visemes: Vec<VisemeCue>,
    ) -> Step {
        let mut guard = self.lock();
        let state = &mut *guard;
        if cancel.is_cancelled() {
            return Step::Cancelled;
        }

        state.active = None;
        state.stats.completed += 1;
        state.stats.consecutive_failures = 0;
        info!(
            "Finished {} from {} ({:?}ms, {} retries)",
            request.id, request.source, duration_ms, request.retry_count
        );

        let completion = Completion {
            id: request.id,
            source: request.source.clone(),
            duration_ms,
            retry_count: request.retry_count,
            visemes,
            skipped: false,
        };
        self.resolve(state, request.id, &request.source, request.retry_count, Ok(completion));
        state.notifier.purge_stale(Instant::now());
        Step::Done
    }

    /// Retry the request or, once retries are used up, fail it.
    fn fail(&self, mut request: AudioRequest, cancel: &CancellationToken, error: PlaybackError) -> Step {
        let mut guard = self.lock();
        let state = &mut *guard;
        if cancel.is_cancelled() {
            return Step::Cancelled;
        }

        state.active = None;
        let attempt = request.retry_count + 1;

        // Undecodable audio fails the same way every time; the device is fine
        if let PlaybackError::Decode(detail) = &error {
            state.stats.failed += 1;
            warn!("Rejecting {} from {}: {error}", request.id, request.source);
            let failure = SpeechError::InvalidRequest(format!("undecodable audio: {detail}"));
            self.resolve(state, request.id, &request.source, request.retry_count, Err(failure));
            return Step::Done;
        }

        state.stats.consecutive_failures += 1;

        if request.retry_count < self.options.max_retries {
            warn!(
                "Attempt {attempt} for {} from {} failed, retrying: {error}",
                request.id, request.source
            );
            request.retry_count += 1;
            state.stats.retried += 1;
            state.notifier.set_active(request.id, false);
            match self.options.retry_placement {
                RetryPlacement::Front => state.pending.push_front(request),
                RetryPlacement::Back => state.pending.push_back(request),
            }
            return Step::Retry;
        }

        state.stats.failed += 1;
        warn!(
            "Giving up on {} from {} after {attempt} attempts: {error}",
            request.id, request.source
        );
        let failure = if request.retry_count == 0 {
            SpeechError::BackendError(error.to_string())
        } else {
            SpeechError::RetriesExhausted {
                attempts: attempt,
                detail: error.to_string(),
            }
        };
        self.resolve(state, request.id, &request.source, request.retry_count, Err(failure));
        Step::Done
    }
}
