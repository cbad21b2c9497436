//! Admission policies: where a new request goes and whether it takes the
//! device from the active one.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::request::AudioRequest;

/// Process-wide admission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// FIFO; never interrupts.
    #[default]
    Queue,
    /// Newest request wins: queue cleared, active stopped.
    Interrupt,
    /// Ordered by priority; strictly higher priority preempts.
    Priority,
}

impl PolicyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Interrupt => "interrupt",
            Self::Priority => "priority",
        }
    }

    pub fn strategy(self) -> &'static dyn AdmissionPolicy {
        match self {
            Self::Queue => &QueuePolicy,
            Self::Interrupt => &InterruptPolicy,
            Self::Priority => &PriorityPolicy,
        }
    }
}

impl std::fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "interrupt" => Ok(Self::Interrupt),
            "priority" => Ok(Self::Priority),
            other => Err(format!("unknown mode '{other}' (expected queue, interrupt or priority)")),
        }
    }
}

/// Where a failed request goes when it is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPlacement {
    /// Head of the queue: the retry plays before anything else.
    #[default]
    Front,
    /// Tail of the queue: everything already waiting plays first.
    Back,
}

/// Decision returned by a policy for one submission.
#[derive(Debug, Default)]
pub struct Admission {
    /// Stop and cancel the active request.
    pub preempt_active: bool,
    /// Pending requests removed to make room; the caller cancels them.
    pub displaced: Vec<AudioRequest>,
}

pub trait AdmissionPolicy: Send + Sync {
    /// Place `request` into `pending`. `active_priority` is the priority of
    /// the request holding the device, if any.
    fn admit(
        &self,
        pending: &mut VecDeque<AudioRequest>,
        active_priority: Option<i32>,
        request: AudioRequest,
    ) -> Admission;
}

pub struct QueuePolicy;

impl AdmissionPolicy for QueuePolicy {
    fn admit(
        &self,
        pending: &mut VecDeque<AudioRequest>,
        _active_priority: Option<i32>,
        request: AudioRequest,
    ) -> Admission {
        pending.push_back(request);
        Admission::default()
    }
}

pub struct InterruptPolicy;

impl AdmissionPolicy for InterruptPolicy {
    fn admit(
        &self,
        pending: &mut VecDeque<AudioRequest>,
        active_priority: Option<i32>,
        request: AudioRequest,
    ) -> Admission {
        let displaced = pending.drain(..).collect();
        pending.push_back(request);
        Admission {
            preempt_active: active_priority.is_some(),
            displaced,
        }
    }
}

pub struct PriorityPolicy;

impl AdmissionPolicy for PriorityPolicy {
    fn admit(
        &self,
        pending: &mut VecDeque<AudioRequest>,
        active_priority: Option<i32>,
        request: AudioRequest,
    ) -> Admission {
        let preempt_active = active_priority.is_some_and(|active| request.priority > active);
        insert_by_priority(pending, request);
        Admission {
            preempt_active,
            displaced: Vec::new(),
        }
    }
}

/// Insert before the first item with strictly lower priority; ties keep
/// arrival order.
pub(crate) fn insert_by_priority(pending: &mut VecDeque<AudioRequest>, request: AudioRequest) {
    match pending.iter().position(|queued| queued.priority < request.priority) {
        Some(index) => pending.insert(index, request),
        None => pending.push_back(request),
    }
}
