//! Speech history and reporting.
//!
//! Every terminal request is appended to `{dir}/{date}-speech.jsonl` by a
//! background recorder subscribed to the scheduler's events.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::SpeechEvent;

fn history_file(dir: &Path, date: &str) -> PathBuf {
    let date_str = if date == "today" {
        Local::now().format("%Y-%m-%d").to_string()
    } else {
        date.to_string()
    };
    dir.join(format!("{date_str}-speech.jsonl"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRecord {
    pub timestamp: String,
    pub id: String,
    pub source: String,
    pub outcome: String,
    pub duration_ms: Option<u64>,
    pub retries: u32,
    pub detail: Option<String>,
}

impl SpeechRecord {
    /// Build a record from a `Finished` event; other events are ignored.
    pub fn from_event(event: &SpeechEvent) -> Option<Self> {
        let SpeechEvent::Finished {
            id,
            source,
            outcome,
            duration_ms,
            retries,
            detail,
        } = event
        else {
            return None;
        };

        let outcome = serde_json::to_value(outcome)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        Some(Self {
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            id: id.to_string(),
            source: source.clone(),
            outcome,
            duration_ms: *duration_ms,
            retries: *retries,
            detail: detail.clone(),
        })
    }
}

pub fn save_record(dir: &Path, record: &SpeechRecord) {
    if let Err(e) = fs::create_dir_all(dir) {
        warn!("Failed to create speech history dir: {e}");
        return;
    }

    let path = history_file(dir, "today");
    let mut file = match fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            warn!("Failed to open speech history file: {e}");
            return;
        }
    };

    match serde_json::to_string(record) {
        Ok(line) => {
            if let Err(e) = writeln!(file, "{line}") {
                warn!("Failed to write speech history record: {e}");
            }
        }
        Err(e) => warn!("Failed to serialize speech record: {e}"),
    }
}

pub fn load_records(dir: &Path, date: &str) -> Vec<SpeechRecord> {
    let contents = match fs::read_to_string(history_file(dir, date)) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

pub fn generate_report(dir: &Path, date: &str) -> String {
    let records = load_records(dir, date);
    if records.is_empty() {
        return format!("No speech records for {date}.");
    }

    let total = records.len();
    let count = |outcome: &str| records.iter().filter(|r| r.outcome == outcome).count();
    let retried = records.iter().filter(|r| r.retries > 0).count();
    let played: Vec<u64> = records.iter().filter_map(|r| r.duration_ms).collect();
    let avg_duration = if played.is_empty() {
        0.0
    } else {
        played.iter().sum::<u64>() as f64 / played.len() as f64
    };

    let mut by_source: BTreeMap<&str, usize> = BTreeMap::new();
    for r in &records {
        *by_source.entry(r.source.as_str()).or_insert(0) += 1;
    }

    let mut report = format!(
        "# Speech Report for {date}\n\n\
        - Total requests: {total}\n\
        - Succeeded: {}\n\
        - Failed: {}\n\
        - Cancelled: {}\n\
        - Needed retries: {retried}\n\
        - Avg duration: {avg_duration:.0}ms\n\n\
        ## Sources\n",
        count("success"),
        count("failed"),
        count("cancelled"),
    );

    for (source, n) in &by_source {
        report.push_str(&format!("- {source}: {n}\n"));
    }

    report
}

/// Append a record for every finished request until the event bus closes.
pub fn spawn_recorder(mut events: broadcast::Receiver<SpeechEvent>, dir: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(record) = SpeechRecord::from_event(&event) {
                        let dir = dir.clone();
                        let _ = tokio::task::spawn_blocking(move || save_record(&dir, &record)).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("History recorder lagged, {missed} events not recorded");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("History recorder stopped");
    })
}
