//! Audio requests and their outcomes.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::AudioClip;
use crate::error::CancelReason;
use crate::synth::{SynthesisRequest, Synthesized, VisemeCue};

/// Priority given to submissions that do not specify one.
pub const DEFAULT_PRIORITY: i32 = 1;

/// Identity assigned to every submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What a request asks the device to play.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Pre-rendered audio.
    Audio(AudioClip),
    /// Text to be synthesized right before playback.
    Speech(SynthesisRequest),
}

impl Payload {
    /// Nothing to play: empty audio or blank text.
    pub fn is_silent(&self) -> bool {
        match self {
            Self::Audio(clip) => clip.is_empty(),
            Self::Speech(speech) => speech.text.trim().is_empty(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Audio(clip) => clip.validate(),
            Self::Speech(speech) => match speech.speed {
                Some(speed) if !(speed.is_finite() && speed > 0.0) => {
                    Err(format!("speech speed must be positive, got {speed}"))
                }
                _ => Ok(()),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Audio(_) => "audio",
            Self::Speech(_) => "speech",
        }
    }
}

/// One unit of speech owned by the scheduler.
#[derive(Debug, Clone)]
pub struct AudioRequest {
    pub id: RequestId,
    pub source: String,
    pub payload: Payload,
    pub priority: i32,
    pub submitted_at: Instant,
    pub retry_count: u32,
    /// Audio produced by synthesis, reused when playback is retried.
    pub(crate) rendered: Option<Synthesized>,
}

impl AudioRequest {
    pub fn new(id: RequestId, source: String, payload: Payload, priority: i32) -> Self {
        Self {
            id,
            source,
            payload,
            priority,
            submitted_at: Instant::now(),
            retry_count: 0,
            rendered: None,
        }
    }
}

/// Terminal outcome of a request; `Pending` until it leaves the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pending,
    Success,
    Failed,
    Cancelled,
}

/// Result handed to a submitter whose request played to the end.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub id: RequestId,
    pub source: String,
    /// Effective playback length, for lip-sync scheduling downstream.
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
    pub visemes: Vec<VisemeCue>,
    /// True when the payload had nothing to play.
    pub skipped: bool,
}

impl Completion {
    pub(crate) fn skipped(id: RequestId, source: String) -> Self {
        Self {
            id,
            source,
            duration_ms: Some(0),
            retry_count: 0,
            visemes: Vec::new(),
            skipped: true,
        }
    }
}

/// Where a request currently stands, as reported by `Scheduler::lookup`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Active,
    Succeeded { completion: Completion },
    Failed { kind: String, error: String },
    Cancelled { reason: CancelReason },
}

impl RequestState {
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Pending | Self::Active => Outcome::Pending,
            Self::Succeeded { .. } => Outcome::Success,
            Self::Failed { .. } => Outcome::Failed,
            Self::Cancelled { .. } => Outcome::Cancelled,
        }
    }
}
