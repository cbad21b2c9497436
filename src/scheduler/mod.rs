//! Audio-request scheduler.
//!
//! - `request`: requests, payloads and outcomes
//! - `policy`: queue / interrupt / priority admission
//! - `notifier`: per-request completion delivery and lookup
//! - `engine`: the queue, the active slot and the worker loop

mod engine;
pub mod notifier;
pub mod policy;
pub mod request;

pub use self::engine::{Scheduler, SchedulerOptions, SchedulerStats, SchedulerStatus};
pub use self::notifier::{SpeechHandle, SpeechResult};
pub use self::policy::{Admission, AdmissionPolicy, PolicyMode, RetryPlacement};
pub use self::request::{
    AudioRequest, Completion, Outcome, Payload, RequestId, RequestState, DEFAULT_PRIORITY,
};
