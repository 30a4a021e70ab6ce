//! Storage ports.
//!
//! The orchestrator persists runs and screenshots through these traits;
//! the storage engine and schema live outside the core. In-memory
//! implementations back the binary and the test suite.

use async_trait::async_trait;
use pilot_core::events::RunCompletionEvent;
use pilot_core::{Event, Id, TestRun};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence for test runs. `save` upserts the full run, embedded
/// executed steps included.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, run: &TestRun) -> Result<()>;
    async fn get(&self, run_id: &Id) -> Result<TestRun>;
}

/// Persistence for step screenshots, keyed by (run-id, step-index).
#[async_trait]
pub trait ScreenshotStore: Send + Sync {
    async fn save(&self, run_id: &Id, step_index: usize, png: &[u8]) -> Result<()>;
}

/// Sink for run completion events.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn publish(&self, event: RunCompletionEvent);
}

/// Append-only audit event log. Appends are best-effort; a failing log
/// never fails the run.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: Event);
}

// --- In-memory implementations ---

/// Run store backed by a process-local map.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<Id, TestRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().map(|runs| runs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save(&self, run: &TestRun) -> Result<()> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get(&self, run_id: &Id) -> Result<TestRun> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }
}

/// Screenshot store that keeps payload sizes only; bytes are dropped.
/// Sufficient for the binary and tests, where the artifact sink is
/// external anyway.
#[derive(Debug, Default)]
pub struct MemoryScreenshotStore {
    saved: Mutex<Vec<(Id, usize, usize)>>,
}

impl MemoryScreenshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// (run-id, step-index, byte-count) entries recorded so far.
    pub fn entries(&self) -> Vec<(Id, usize, usize)> {
        self.saved.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ScreenshotStore for MemoryScreenshotStore {
    async fn save(&self, run_id: &Id, step_index: usize, png: &[u8]) -> Result<()> {
        let mut saved = self
            .saved
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        saved.push((run_id.clone(), step_index, png.len()));
        Ok(())
    }
}

/// Completion sink that records events for inspection.
#[derive(Debug, Default)]
pub struct MemoryCompletionSink {
    events: Mutex<Vec<RunCompletionEvent>>,
}

impl MemoryCompletionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunCompletionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionSink for MemoryCompletionSink {
    async fn publish(&self, event: RunCompletionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Event log that records entries for inspection.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn append(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Event log that emits entries through tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn append(&self, event: Event) {
        tracing::info!(
            run_id = %event.run_id,
            event_type = event.event_type.as_str(),
            payload = %event.payload_json,
            "audit event"
        );
    }
}
