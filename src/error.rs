//! Error types for avatar-speech.
//!
//! `SpeechError` is what a submitter sees when its request does not end in
//! success. `Error` covers failures of the hosting service itself.

use serde::Serialize;
use thiserror::Error;

use crate::backend::PlaybackError;
use crate::scheduler::Outcome;

/// Why a request was cancelled instead of played to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Another submission took the device (interrupt or priority mode).
    Preempted,
    /// Dropped from the pending queue by `clear_queue`.
    QueueCleared,
    /// The scheduler shut down before the request finished.
    Shutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preempted => write!(f, "preempted"),
            Self::QueueCleared => write!(f, "queue cleared"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Terminal failure of a single speech request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpeechError {
    /// Playback or synthesis failed and no retries were configured.
    #[error("Backend error: {0}")]
    BackendError(String),

    /// Playback or synthesis failed on every attempt.
    #[error("Retries exhausted after {attempts} attempts: {detail}")]
    RetriesExhausted { attempts: u32, detail: String },

    /// The request was cancelled before or during playback.
    #[error("Interrupted: {0}")]
    Interrupted(CancelReason),

    /// Malformed payload, rejected at submission.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SpeechError {
    /// Stable snake_case name used in logs and the HTTP API.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BackendError(_) => "backend_error",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Interrupted(_) => "interrupted",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Interrupted(_) => Outcome::Cancelled,
            _ => Outcome::Failed,
        }
    }
}

/// Main error type for the avatar-speech service
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("HTTP server error: {0}")]
    Http(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the service Error
pub type Result<T> = std::result::Result<T, Error>;
