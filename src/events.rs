//! Side-channel notifications for visual collaborators (motion/expression
//! triggers, lip-sync drivers) and the history recorder.
//!
//! Fire-and-forget over `tokio::sync::broadcast`: a slow subscriber lags and
//! loses events, it never holds up the scheduler.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::scheduler::{Outcome, RequestId};
use crate::synth::VisemeCue;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SpeechEvent {
    /// Audio for `source` began playing.
    Started {
        id: RequestId,
        source: String,
        attempt: u32,
        duration_ms: Option<u64>,
        visemes: Vec<VisemeCue>,
    },
    /// A request reached its terminal outcome.
    Finished {
        id: RequestId,
        source: String,
        outcome: Outcome,
        duration_ms: Option<u64>,
        retries: u32,
        detail: Option<String>,
    },
}

impl SpeechEvent {
    pub fn id(&self) -> RequestId {
        match self {
            Self::Started { id, .. } | Self::Finished { id, .. } => *id,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Self::Started { source, .. } | Self::Finished { source, .. } => source,
        }
    }
}

pub(crate) struct EventBus {
    tx: Mutex<Option<broadcast::Sender<SpeechEvent>>>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<broadcast::Sender<SpeechEvent>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn emit(&self, event: SpeechEvent) {
        // No subscribers is fine
        if let Some(tx) = self.sender().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// A receiver on a closed bus reports `Closed` straight away.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SpeechEvent> {
        match self.sender().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Drop the sender. Receivers get what is buffered, then `Closed`.
    pub(crate) fn close(&self) {
        self.sender().take();
    }
}
