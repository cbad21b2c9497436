//! Completion notifier: one-shot delivery of each request's outcome, plus a
//! short-lived table of finished requests for lookup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use super::request::{Completion, RequestId, RequestState};
use crate::error::{CancelReason, SpeechError};

pub type SpeechResult = Result<Completion, SpeechError>;

/// Caller's side of a submission. Await it for the terminal outcome.
#[derive(Debug)]
pub struct SpeechHandle {
    id: RequestId,
    rx: oneshot::Receiver<SpeechResult>,
}

impl SpeechHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for SpeechHandle {
    type Output = SpeechResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the scheduler went away without resolving
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(SpeechError::Interrupted(CancelReason::Shutdown))))
    }
}

enum Record {
    Waiting {
        tx: oneshot::Sender<SpeechResult>,
        active: bool,
    },
    Resolved {
        state: RequestState,
        at: Instant,
    },
}

pub(crate) struct CompletionNotifier {
    records: HashMap<RequestId, Record>,
    retention: Duration,
}

impl CompletionNotifier {
    pub(crate) fn new(retention: Duration) -> Self {
        Self {
            records: HashMap::new(),
            retention,
        }
    }

    pub(crate) fn register(&mut self, id: RequestId) -> SpeechHandle {
        let (tx, rx) = oneshot::channel();
        self.records.insert(id, Record::Waiting { tx, active: false });
        SpeechHandle { id, rx }
    }

    pub(crate) fn set_active(&mut self, id: RequestId, is_active: bool) {
        if let Some(Record::Waiting { active, .. }) = self.records.get_mut(&id) {
            *active = is_active;
        }
    }

    /// Record the terminal outcome and wake the submitter. Returns false if
    /// the request was unknown or already resolved.
    pub(crate) fn resolve(&mut self, id: RequestId, result: SpeechResult) -> bool {
        let Some(Record::Waiting { .. }) = self.records.get(&id) else {
            return false;
        };

        let state = match &result {
            Ok(completion) => RequestState::Succeeded {
                completion: completion.clone(),
            },
            Err(SpeechError::Interrupted(reason)) => RequestState::Cancelled { reason: *reason },
            Err(e) => RequestState::Failed {
                kind: e.kind().to_string(),
                error: e.to_string(),
            },
        };

        let resolved = Record::Resolved {
            state,
            at: Instant::now(),
        };
        if let Some(Record::Waiting { tx, .. }) = self.records.insert(id, resolved) {
            // The submitter may have dropped its handle; the record stays either way
            let _ = tx.send(result);
        }
        true
    }

    pub(crate) fn lookup(&self, id: RequestId) -> Option<RequestState> {
        self.records.get(&id).map(|record| match record {
            Record::Waiting { active: true, .. } => RequestState::Active,
            Record::Waiting { active: false, .. } => RequestState::Pending,
            Record::Resolved { state, .. } => state.clone(),
        })
    }

    /// Drop resolved records older than the retention window.
    pub(crate) fn purge_stale(&mut self, now: Instant) -> usize {
        let retention = self.retention;
        let before = self.records.len();
        self.records.retain(|_, record| match record {
            Record::Waiting { .. } => true,
            Record::Resolved { at, .. } => now.saturating_duration_since(*at) < retention,
        });
        let purged = before - self.records.len();
        if purged > 0 {
            debug!("Purged {purged} stale request records");
        }
        purged
    }
}
