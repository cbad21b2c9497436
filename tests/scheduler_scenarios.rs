//! End-to-end scheduling scenarios against the simulated device, on tokio's
//! paused clock so playback time is virtual.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use avatar_speech::backend::simulated::StreamEnd;
use avatar_speech::scheduler::RetryPlacement;
use avatar_speech::history;
use avatar_speech::synth::{Synthesized, VisemeCue};
use avatar_speech::{
    AudioClip, CancelReason, Payload, PlaybackError, PolicyMode, RequestState, Scheduler,
    SchedulerOptions, SimulatedBackend, SpeechError, SpeechEvent, SynthesisRequest, Synthesizer,
};
use tokio::sync::broadcast::error::RecvError;

fn clip(ms: u64) -> Payload {
    Payload::Audio(AudioClip::silence(Duration::from_millis(ms), 16_000))
}

fn options(mode: PolicyMode) -> SchedulerOptions {
    SchedulerOptions {
        mode,
        ..SchedulerOptions::default()
    }
}

fn start(backend: &SimulatedBackend, options: SchedulerOptions) -> Scheduler {
    Scheduler::start(Arc::new(backend.clone()), None, options)
}

/// Let the worker pick up whatever was just submitted.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn played_ms(backend: &SimulatedBackend) -> Vec<u128> {
    backend
        .streams()
        .iter()
        .map(|s| s.duration.as_millis())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn concurrent_submissions_never_overlap() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.submit(format!("avatar-{i}"), clip(100), None).await })
        })
        .collect();

    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }
    assert_eq!(backend.streams().len(), 5);
    assert_eq!(backend.max_concurrent(), 1);
    assert_eq!(scheduler.status().stats.completed, 5);
}

#[tokio::test(start_paused = true)]
async fn queue_mode_plays_in_submission_order_with_a_gap() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let a = scheduler.submit("mira", clip(100), None);
    let b = scheduler.submit("kai", clip(200), None);
    let c = scheduler.submit("mira", clip(300), None);

    assert_eq!(a.await.unwrap().duration_ms, Some(100));
    assert_eq!(b.await.unwrap().duration_ms, Some(200));
    assert_eq!(c.await.unwrap().duration_ms, Some(300));
    assert_eq!(played_ms(&backend), vec![100, 200, 300]);

    let streams = backend.streams();
    for pair in streams.windows(2) {
        let ended = pair[0].ended_at.unwrap();
        assert!(pair[1].started_at >= ended + Duration::from_millis(300));
    }
    assert_eq!(scheduler.status().stats.queued, 2);
}

#[tokio::test(start_paused = true)]
async fn priority_mode_orders_waiting_requests() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Priority));

    let current = scheduler.submit("narrator", clip(1000), Some(9));
    settle().await;
    let low = scheduler.submit("mira", clip(200), Some(1));
    let high = scheduler.submit("kai", clip(300), Some(5));
    assert_eq!(scheduler.status().queue_length, 2);

    assert!(current.await.is_ok());
    assert!(high.await.is_ok());
    assert!(low.await.is_ok());
    assert_eq!(played_ms(&backend), vec![1000, 300, 200]);
}

#[tokio::test(start_paused = true)]
async fn priority_mode_preempts_only_strictly_higher() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Priority));

    let first = scheduler.submit("mira", clip(1000), Some(1));
    settle().await;
    let peer = scheduler.submit("kai", clip(100), Some(1));
    assert!(scheduler.status().is_playing);
    assert_eq!(scheduler.status().stats.interrupted, 0);

    let urgent = scheduler.submit("alarm", clip(100), Some(5));
    assert_eq!(
        first.await,
        Err(SpeechError::Interrupted(CancelReason::Preempted))
    );
    assert!(urgent.await.is_ok());
    assert!(peer.await.is_ok());

    let status = scheduler.status();
    assert_eq!(status.stats.interrupted, 1);
    assert_eq!(backend.streams()[0].end, Some(StreamEnd::Stopped));
}

#[tokio::test(start_paused = true)]
async fn interrupt_mode_replaces_the_active_request() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Interrupt));

    let a = scheduler.submit("mira", clip(1000), None);
    settle().await;
    let b = scheduler.submit("kai", clip(500), None);
    let b_id = b.id();

    assert_eq!(a.await, Err(SpeechError::Interrupted(CancelReason::Preempted)));
    settle().await;

    let status = scheduler.status();
    assert_eq!(status.current_id, Some(b_id));
    assert_eq!(status.current_source.as_deref(), Some("kai"));
    assert_eq!(status.queue_length, 0);
    assert_eq!(backend.max_concurrent(), 1);

    // Preemption skips the inter-item gap
    let streams = backend.streams();
    assert_eq!(streams[1].started_at, streams[0].ended_at.unwrap());
    assert!(b.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn interrupt_mode_discards_waiting_requests() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Interrupt));

    let a = scheduler.submit("mira", clip(1000), None);
    settle().await;
    let b = scheduler.submit("kai", clip(500), None);
    let c = scheduler.submit("mira", clip(500), None);

    assert_eq!(a.await, Err(SpeechError::Interrupted(CancelReason::Preempted)));
    assert_eq!(b.await, Err(SpeechError::Interrupted(CancelReason::Preempted)));
    assert!(c.await.is_ok());

    let stats = scheduler.status().stats;
    assert_eq!(stats.interrupted, 1);
    assert_eq!(stats.cancelled, 2);
    assert_eq!(played_ms(&backend), vec![1000, 500]);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let backend = SimulatedBackend::default();
    backend.fail_next_plays(2, PlaybackError::Device("glitch".into()));
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let completion = scheduler.submit("mira", clip(100), None).await.unwrap();
    assert_eq!(completion.retry_count, 2);
    assert_eq!(backend.streams().len(), 3);

    let stats = scheduler.status().stats;
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_start_counts_as_an_attempt() {
    let backend = SimulatedBackend::default();
    backend.fail_next_starts(1, PlaybackError::Device("busy".into()));
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let completion = scheduler.submit("mira", clip(100), None).await.unwrap();
    assert_eq!(completion.retry_count, 1);
    assert_eq!(backend.streams().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_run_out_after_three_attempts() {
    let backend = SimulatedBackend::default();
    backend.fail_next_plays(3, PlaybackError::Device("glitch".into()));
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let result = scheduler.submit("mira", clip(100), None).await;
    match result {
        Err(SpeechError::RetriesExhausted { attempts, detail }) => {
            assert_eq!(attempts, 3);
            assert!(detail.contains("glitch"));
        }
        other => panic!("expected retries_exhausted, got {other:?}"),
    }

    let status = scheduler.status();
    assert_eq!(status.stats.failed, 1);
    assert!(status.degraded);
    assert!(!status.is_playing);

    // One success clears the degraded flag
    assert!(scheduler.submit("mira", clip(100), None).await.is_ok());
    assert!(!scheduler.status().degraded);
}

#[tokio::test(start_paused = true)]
async fn no_retries_reports_backend_error() {
    let backend = SimulatedBackend::default();
    backend.fail_next_plays(1, PlaybackError::Device("unplugged".into()));
    let scheduler = start(
        &backend,
        SchedulerOptions {
            max_retries: 0,
            ..SchedulerOptions::default()
        },
    );

    let result = scheduler.submit("mira", clip(100), None).await;
    assert!(matches!(result, Err(SpeechError::BackendError(_))));
}

#[tokio::test(start_paused = true)]
async fn retry_goes_to_the_front_by_default() {
    let backend = SimulatedBackend::default();
    backend.fail_next_plays(1, PlaybackError::Device("glitch".into()));
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let a = scheduler.submit("mira", clip(100), None);
    let b = scheduler.submit("kai", clip(200), None);
    assert_eq!(a.await.unwrap().retry_count, 1);
    assert!(b.await.is_ok());
    assert_eq!(played_ms(&backend), vec![100, 100, 200]);
}

#[tokio::test(start_paused = true)]
async fn retry_can_go_to_the_back() {
    let backend = SimulatedBackend::default();
    backend.fail_next_plays(1, PlaybackError::Device("glitch".into()));
    let scheduler = start(
        &backend,
        SchedulerOptions {
            retry_placement: RetryPlacement::Back,
            ..SchedulerOptions::default()
        },
    );

    let a = scheduler.submit("mira", clip(100), None);
    let b = scheduler.submit("kai", clip(200), None);
    assert!(b.await.is_ok());
    assert_eq!(a.await.unwrap().retry_count, 1);
    assert_eq!(played_ms(&backend), vec![100, 200, 100]);
}

#[tokio::test(start_paused = true)]
async fn clear_queue_spares_the_active_request() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let a = scheduler.submit("mira", clip(1000), None);
    settle().await;
    let b = scheduler.submit("kai", clip(100), None);
    let c = scheduler.submit("kai", clip(100), None);

    assert_eq!(scheduler.clear_queue(), 2);
    assert_eq!(b.await, Err(SpeechError::Interrupted(CancelReason::QueueCleared)));
    assert_eq!(c.await, Err(SpeechError::Interrupted(CancelReason::QueueCleared)));
    assert!(a.await.is_ok());

    assert_eq!(scheduler.clear_queue(), 0);
    assert_eq!(scheduler.status().stats.cancelled, 2);
    assert_eq!(backend.streams().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn set_mode_is_idempotent() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Queue));

    assert!(scheduler.set_mode(PolicyMode::Interrupt));
    assert!(!scheduler.set_mode(PolicyMode::Interrupt));
    assert_eq!(scheduler.mode(), PolicyMode::Interrupt);
    assert_eq!(scheduler.status().mode, PolicyMode::Interrupt);
}

#[tokio::test(start_paused = true)]
async fn mode_change_applies_to_later_submissions() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let a = scheduler.submit("mira", clip(1000), None);
    settle().await;
    let b = scheduler.submit("kai", clip(100), None);
    scheduler.set_mode(PolicyMode::Interrupt);
    let c = scheduler.submit("mira", clip(100), None);

    assert_eq!(a.await, Err(SpeechError::Interrupted(CancelReason::Preempted)));
    assert_eq!(b.await, Err(SpeechError::Interrupted(CancelReason::Preempted)));
    assert!(c.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_everything() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let a = scheduler.submit("mira", clip(1000), None);
    settle().await;
    let b = scheduler.submit("kai", clip(100), None);

    scheduler.shutdown().await;
    assert_eq!(a.await, Err(SpeechError::Interrupted(CancelReason::Shutdown)));
    assert_eq!(b.await, Err(SpeechError::Interrupted(CancelReason::Shutdown)));
    assert_eq!(backend.playing(), 0);

    let late = scheduler.submit("mira", clip(100), None).await;
    assert_eq!(late, Err(SpeechError::Interrupted(CancelReason::Shutdown)));
    assert_eq!(backend.streams().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_audio_completes_without_playing() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let empty = Payload::Audio(AudioClip::pcm(Vec::<f32>::new(), 16_000, 1));
    let completion = scheduler.submit("mira", empty, None).await.unwrap();
    assert!(completion.skipped);
    assert!(backend.streams().is_empty());
    assert_eq!(scheduler.status().stats.submitted, 0);
}

#[tokio::test(start_paused = true)]
async fn blank_text_completes_without_a_synthesizer() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let blank = Payload::Speech(SynthesisRequest::text("   "));
    let completion = scheduler.submit("mira", blank, None).await.unwrap();
    assert!(completion.skipped);
    assert_eq!(completion.duration_ms, Some(0));
    assert!(backend.streams().is_empty());
}

#[tokio::test(start_paused = true)]
async fn undecodable_audio_is_rejected_without_retry() {
    let backend = SimulatedBackend::default();
    backend.fail_next_starts(1, PlaybackError::Decode("not audio".into()));
    let scheduler = start(&backend, options(PolicyMode::Queue));

    match scheduler.submit("mira", clip(100), None).await {
        Err(SpeechError::InvalidRequest(detail)) => assert!(detail.contains("not audio")),
        other => panic!("expected invalid_request, got {other:?}"),
    }
    let stats = scheduler.status().stats;
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.consecutive_failures, 0);

    // The device itself is still usable
    assert!(scheduler.submit("kai", clip(100), None).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn malformed_payloads_are_rejected() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let bad_rate = Payload::Audio(AudioClip::pcm(vec![0.0f32; 16], 0, 1));
    assert!(matches!(
        scheduler.submit("mira", bad_rate, None).await,
        Err(SpeechError::InvalidRequest(_))
    ));

    // No synthesizer configured
    let speech = Payload::Speech(SynthesisRequest::text("hello"));
    assert!(matches!(
        scheduler.submit("mira", speech, None).await,
        Err(SpeechError::InvalidRequest(_))
    ));
    assert!(backend.streams().is_empty());
}

#[tokio::test(start_paused = true)]
async fn lookup_follows_a_request_until_retention_expires() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Queue));

    let a = scheduler.submit("mira", clip(500), None);
    let b = scheduler.submit("kai", clip(100), None);
    let (a_id, b_id) = (a.id(), b.id());
    settle().await;

    assert_eq!(scheduler.lookup(a_id), Some(RequestState::Active));
    assert_eq!(scheduler.lookup(b_id), Some(RequestState::Pending));

    assert!(a.await.is_ok());
    assert!(b.await.is_ok());
    assert!(matches!(
        scheduler.lookup(a_id),
        Some(RequestState::Succeeded { .. })
    ));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(scheduler.lookup(a_id), None);
    assert_eq!(scheduler.lookup(b_id), None);
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_the_event_stream_and_the_recorder() {
    let backend = SimulatedBackend::default();
    let scheduler = start(&backend, options(PolicyMode::Queue));
    let dir = tempfile::tempdir().unwrap();
    let recorder = history::spawn_recorder(scheduler.subscribe(), dir.path().to_path_buf());
    let mut events = scheduler.subscribe();

    let pending = scheduler.submit("mira", clip(1000), None);
    settle().await;
    scheduler.shutdown().await;
    assert!(pending.await.is_err());

    // Finishes on its own once the bus closes
    recorder.await.unwrap();
    let records = history::load_records(dir.path(), "today");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, "cancelled");

    assert!(matches!(events.recv().await, Ok(SpeechEvent::Started { .. })));
    assert!(matches!(events.recv().await, Ok(SpeechEvent::Finished { .. })));
    assert!(matches!(events.recv().await, Err(RecvError::Closed)));
    assert!(matches!(scheduler.subscribe().recv().await, Err(RecvError::Closed)));
}

/// Takes `delay` per call, failing the first `failures` calls.
struct CountingSynth {
    calls: AtomicUsize,
    failures: AtomicUsize,
    delay: Duration,
}

impl CountingSynth {
    fn new(failures: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures: AtomicUsize::new(failures),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for CountingSynth {
    async fn synthesize(&self, _request: &SynthesisRequest) -> Result<Synthesized, PlaybackError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PlaybackError::Synthesis("model busy".into()));
        }
        Ok(Synthesized {
            clip: AudioClip::silence(Duration::from_millis(250), 16_000),
            visemes: vec![VisemeCue {
                offset_ms: 0,
                shape: "aa".into(),
            }],
        })
    }
}

#[tokio::test(start_paused = true)]
async fn speech_is_synthesized_once_and_replayed_on_retry() {
    let backend = SimulatedBackend::default();
    backend.fail_next_plays(1, PlaybackError::Device("glitch".into()));
    let synth = CountingSynth::new(0, Duration::from_millis(50));
    let scheduler = Scheduler::start(
        Arc::new(backend.clone()),
        Some(synth.clone()),
        SchedulerOptions::default(),
    );
    let mut events = scheduler.subscribe();

    let completion = scheduler
        .submit("mira", Payload::Speech(SynthesisRequest::text("hello there")), None)
        .await
        .unwrap();

    assert_eq!(synth.calls(), 1);
    assert_eq!(completion.retry_count, 1);
    assert_eq!(completion.duration_ms, Some(250));
    assert_eq!(completion.visemes.len(), 1);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(
        &seen[0],
        SpeechEvent::Started { attempt: 1, visemes, .. } if visemes.len() == 1
    ));
    assert!(matches!(seen.last(), Some(SpeechEvent::Finished { retries: 1, .. })));
    assert!(seen.iter().all(|e| e.source() == "mira"));
}

#[tokio::test(start_paused = true)]
async fn synthesis_failures_are_retried() {
    let backend = SimulatedBackend::default();
    let synth = CountingSynth::new(2, Duration::from_millis(50));
    let scheduler = Scheduler::start(
        Arc::new(backend.clone()),
        Some(synth.clone()),
        SchedulerOptions::default(),
    );

    let completion = scheduler
        .submit("mira", Payload::Speech(SynthesisRequest::text("hello")), None)
        .await
        .unwrap();

    assert_eq!(completion.retry_count, 2);
    assert_eq!(synth.calls(), 3);
    assert_eq!(backend.streams().len(), 1);
    assert_eq!(scheduler.status().stats.retried, 2);
}

#[tokio::test(start_paused = true)]
async fn preemption_during_synthesis_stops_before_playback() {
    let backend = SimulatedBackend::default();
    let synth = CountingSynth::new(0, Duration::from_millis(200));
    let scheduler = Scheduler::start(
        Arc::new(backend.clone()),
        Some(synth.clone()),
        options(PolicyMode::Interrupt),
    );

    let a = scheduler.submit("mira", Payload::Speech(SynthesisRequest::text("long story")), None);
    settle().await;
    assert!(scheduler.status().is_playing);
    let b = scheduler.submit("kai", clip(100), None);

    assert_eq!(a.await, Err(SpeechError::Interrupted(CancelReason::Preempted)));
    assert!(b.await.is_ok());

    // Only the preempting clip ever reached the device
    assert_eq!(synth.calls(), 1);
    assert_eq!(played_ms(&backend), vec![100]);
    assert_eq!(backend.max_concurrent(), 1);
    assert_eq!(scheduler.status().stats.interrupted, 1);
}
