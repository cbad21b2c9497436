//! rodio output: one `Sink` per stream on the default device.
//!
//! A blocking watcher per stream polls the sink until it drains, the stream
//! is stopped, or the maximum playback duration passes. The live-stream table
//! is the single point of truth: whoever removes an entry owns its `done`
//! sender, so a stopped stream can never report completion.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rodio::buffer::SamplesBuffer;
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink, Source};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{AudioClip, PlaybackBackend, PlaybackError, PlaybackStream, StreamId};
use crate::config::PlaybackConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct LiveSink {
    sink: Sink,
    done: oneshot::Sender<Result<(), PlaybackError>>,
}

type LiveTable = Arc<Mutex<HashMap<StreamId, LiveSink>>>;

/// Default-device playback through rodio.
pub struct RodioBackend {
    // Kept alive for the backend's lifetime; dropping it silences every sink.
    stream: OutputStream,
    volume: f32,
    max_duration: Duration,
    next_id: AtomicU64,
    live: LiveTable,
}

impl RodioBackend {
    /// Open the default output device.
    pub fn open(config: &PlaybackConfig) -> Result<Self, PlaybackError> {
        let stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| PlaybackError::Device(format!("Failed to open audio output: {e}")))?;
        info!(
            "Audio output opened (volume {:.2}, max duration {}s)",
            config.volume, config.max_duration_secs
        );

        Ok(Self {
            stream,
            volume: config.volume,
            max_duration: Duration::from_secs(config.max_duration_secs),
            next_id: AtomicU64::new(1),
            live: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn live(&self) -> MutexGuard<'_, HashMap<StreamId, LiveSink>> {
        lock_table(&self.live)
    }
}

fn lock_table(live: &LiveTable) -> MutexGuard<'_, HashMap<StreamId, LiveSink>> {
    live.lock().unwrap_or_else(|e| e.into_inner())
}

/// Remove the stream and report its result, unless `stop` got there first.
fn finish(live: &LiveTable, id: StreamId, result: Result<(), PlaybackError>) {
    if let Some(entry) = lock_table(live).remove(&id) {
        entry.sink.stop();
        let _ = entry.done.send(result);
    }
}

impl PlaybackBackend for RodioBackend {
    fn start(&self, clip: &AudioClip) -> Result<PlaybackStream, PlaybackError> {
        let sink = Sink::connect_new(self.stream.mixer());
        sink.set_volume(self.volume);

        let duration = match clip {
            AudioClip::Encoded(bytes) => {
                let decoder = Decoder::new(Cursor::new(bytes.clone()))
                    .map_err(|e| PlaybackError::Decode(e.to_string()))?;
                let duration = decoder.total_duration().or_else(|| clip.duration());
                sink.append(decoder);
                duration
            }
            AudioClip::Pcm {
                samples,
                sample_rate,
                channels,
            } => {
                sink.append(SamplesBuffer::new(*channels, *sample_rate, samples.to_vec()));
                clip.duration()
            }
        };

        let id = StreamId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (done_tx, done_rx) = oneshot::channel();
        self.live().insert(id, LiveSink { sink, done: done_tx });
        debug!("{id} started ({duration:?})");

        let live = self.live.clone();
        let max_duration = self.max_duration;
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            loop {
                let drained = match lock_table(&live).get(&id) {
                    Some(entry) => entry.sink.empty(),
                    // Stopped: the entry and its sender are already gone
                    None => return,
                };

                if drained {
                    finish(&live, id, Ok(()));
                    return;
                }

                if started.elapsed() >= max_duration {
                    warn!("{id} exceeded {max_duration:?}, stopping");
                    finish(&live, id, Err(PlaybackError::Timeout(max_duration)));
                    return;
                }

                std::thread::sleep(POLL_INTERVAL);
            }
        });

        Ok(PlaybackStream {
            id,
            duration,
            done: done_rx,
        })
    }

    fn stop(&self, stream: StreamId) {
        if let Some(entry) = self.live().remove(&stream) {
            entry.sink.stop();
            debug!("{stream} stopped");
        }
    }

    fn name(&self) -> &'static str {
        "rodio"
    }
}
