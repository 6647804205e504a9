//! Per-request log of agent calls.
//!
//! Each call to the reasoning service produces one [`ActionRecord`] keyed by
//! the request id. Sinks are injected by the caller; nothing is global.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{mpsc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::agents::AgentAction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ActionOutcome {
    Ok,
    Error { code: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub request_id: Uuid,
    pub timestamp_ms: i64,
    pub action: AgentAction,
    pub model: String,
    pub elapsed_ms: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    /// blake3 of the rendered user message.
    pub input_hash: String,
    pub outcome: ActionOutcome,
}

#[derive(Debug, thiserror::Error)]
pub enum ActionLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("action log channel closed")]
    Closed,
    #[error("action log worker failed: {0}")]
    Join(String),
}

pub trait ActionSink: Send + Sync {
    fn record(&self, record: ActionRecord) -> Result<(), ActionLogError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActionSink;

impl ActionSink for NoopActionSink {
    fn record(&self, _record: ActionRecord) -> Result<(), ActionLogError> {
        Ok(())
    }
}

/// Keeps records in memory. Used by tests and the run report.
#[derive(Debug, Default)]
pub struct MemoryActionSink {
    records: Mutex<Vec<ActionRecord>>,
}

impl MemoryActionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ActionRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, action: AgentAction) -> usize {
        self.records
            .lock()
            .map(|r| r.iter().filter(|rec| rec.action == action).count())
            .unwrap_or(0)
    }
}

impl ActionSink for MemoryActionSink {
    fn record(&self, record: ActionRecord) -> Result<(), ActionLogError> {
        self.records
            .lock()
            .map_err(|_| ActionLogError::Closed)?
            .push(record);
        Ok(())
    }
}

/// Writes one JSON object per line from a background thread.
#[derive(Clone)]
pub struct JsonlActionSink {
    sender: mpsc::Sender<ActionRecord>,
}

/// Owns the writer thread; `join` after the last sink clone is dropped.
pub struct ActionLogWorker {
    handle: Option<std::thread::JoinHandle<Result<(), ActionLogError>>>,
}

impl ActionLogWorker {
    pub fn join(mut self) -> Result<(), ActionLogError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(ActionLogError::Join("action log writer panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlActionSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, ActionLogWorker), ActionLogError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<ActionRecord>();
        let handle = std::thread::spawn(move || write_loop(file, receiver));
        Ok((
            Self { sender },
            ActionLogWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl ActionSink for JsonlActionSink {
    fn record(&self, record: ActionRecord) -> Result<(), ActionLogError> {
        self.sender.send(record).map_err(|_| ActionLogError::Closed)
    }
}

fn write_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<ActionRecord>,
) -> Result<(), ActionLogError> {
    let mut writer = BufWriter::new(file);
    for record in receiver {
        let line =
            serde_json::to_string(&record).map_err(|e| ActionLogError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn hash_input(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}
