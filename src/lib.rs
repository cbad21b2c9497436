//! avatar-speech: serializes concurrent speech requests from avatar
//! characters onto a single audio output.
//!
//! Every submission goes through one [`Scheduler`], which decides (by its
//! current [`PolicyMode`]) whether the request waits, preempts the one
//! playing, or jumps ahead by priority. Callers await a [`SpeechHandle`] for
//! the terminal outcome.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod scheduler;
pub mod synth;

pub use crate::backend::{AudioClip, PlaybackBackend, PlaybackError, RodioBackend, SimulatedBackend};
pub use crate::config::Config;
pub use crate::error::{CancelReason, Error, Result, SpeechError};
pub use crate::events::SpeechEvent;
pub use crate::scheduler::{
    Completion, Payload, PolicyMode, RequestId, RequestState, Scheduler, SchedulerOptions,
    SchedulerStatus, SpeechHandle, SpeechResult,
};
pub use crate::synth::{HttpSynthesizer, SynthesisRequest, Synthesizer};
