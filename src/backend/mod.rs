//! Playback backends: the single output device the scheduler serializes onto.
//!
//! Two-phase contract: `start` hands back a [`PlaybackStream`] whose `done`
//! channel fires exactly once, and `stop` removes the stream so that channel
//! never fires afterwards (the sender is dropped instead).

pub mod speaker;
pub mod simulated;

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

pub use self::speaker::RodioBackend;
pub use self::simulated::SimulatedBackend;

/// Failure reported by a backend or by the synthesis step in front of it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Playback exceeded {0:?}")]
    Timeout(Duration),

    #[error("Synthesis error: {0}")]
    Synthesis(String),
}

/// Audio ready for the device. Cheap to clone so retries replay the same data.
#[derive(Debug, Clone)]
pub enum AudioClip {
    /// Container-encoded audio (WAV, MP3, ...).
    Encoded(Arc<[u8]>),
    /// Interleaved f32 samples.
    Pcm {
        samples: Arc<[f32]>,
        sample_rate: u32,
        channels: u16,
    },
}

impl AudioClip {
    pub fn encoded(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Encoded(Arc::from(bytes.into()))
    }

    pub fn pcm(samples: impl Into<Vec<f32>>, sample_rate: u32, channels: u16) -> Self {
        Self::Pcm {
            samples: Arc::from(samples.into()),
            sample_rate,
            channels,
        }
    }

    /// Mono PCM silence, handy for placeholders and tests.
    pub fn silence(duration: Duration, sample_rate: u32) -> Self {
        let frames = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
        Self::pcm(vec![0.0f32; frames], sample_rate, 1)
    }

    /// True when there is nothing to play.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Encoded(bytes) => bytes.is_empty(),
            Self::Pcm { samples, .. } => samples.is_empty(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Pcm { sample_rate: 0, .. } => Err("PCM clip has a zero sample rate".into()),
            Self::Pcm { channels: 0, .. } => Err("PCM clip has zero channels".into()),
            _ => Ok(()),
        }
    }

    /// Playback length when it can be known without decoding.
    ///
    /// PCM is computed from the sample count; encoded clips are only
    /// measured when they carry a WAV header.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Pcm {
                samples,
                sample_rate,
                channels,
            } => {
                if *sample_rate == 0 || *channels == 0 {
                    return None;
                }
                let frames = samples.len() as f64 / *channels as f64;
                Some(Duration::from_secs_f64(frames / *sample_rate as f64))
            }
            Self::Encoded(bytes) => {
                let reader = hound::WavReader::new(Cursor::new(bytes.as_ref())).ok()?;
                let rate = reader.spec().sample_rate;
                if rate == 0 {
                    return None;
                }
                // hound reports length in frames (samples per channel)
                Some(Duration::from_secs_f64(reader.duration() as f64 / rate as f64))
            }
        }
    }
}

/// Identity of one started stream, unique per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// A stream that has started playing.
pub struct PlaybackStream {
    pub id: StreamId,
    /// Expected length, when the backend knows it.
    pub duration: Option<Duration>,
    /// Fires once with the end-of-stream result. Dropped unsent after `stop`.
    pub done: oneshot::Receiver<Result<(), PlaybackError>>,
}

/// The shared output device.
pub trait PlaybackBackend: Send + Sync {
    /// Begin playing `clip`. Must not block until the clip ends.
    fn start(&self, clip: &AudioClip) -> Result<PlaybackStream, PlaybackError>;

    /// Stop a stream. After this returns its `done` channel never fires.
    fn stop(&self, stream: StreamId);

    fn name(&self) -> &'static str;
}
