//! Admission audit trail.
//!
//! Every admission decision is recorded through [`AuditWriter`], which
//! hands records to a pluggable sink on a detached task. A failing or slow
//! sink never affects the admission path.

use async_trait::async_trait;
use pilot_core::AuditRecord;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Write one record. Errors are the sink's to report; the caller has
    /// already moved on.
    async fn write(&self, record: AuditRecord) -> Result<(), String>;
}

/// Sink that logs records through tracing. Default when no external sink
/// is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, record: AuditRecord) -> Result<(), String> {
        tracing::info!(
            tenant_id = %record.tenant_id,
            client_ip = %record.client_ip,
            domain = %record.extracted_domain,
            decision = record.decision.as_str(),
            reason = %record.reason,
            "admission audit"
        );
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, record: AuditRecord) -> Result<(), String> {
        self.records
            .lock()
            .map(|mut records| records.push(record))
            .map_err(|e| e.to_string())
    }
}

/// Fire-and-forget audit writer.
#[derive(Clone)]
pub struct AuditWriter {
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for AuditWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditWriter").finish_non_exhaustive()
    }
}

impl AuditWriter {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Record asynchronously. The spawned task swallows sink failures with
    /// a warning; admission latency is unaffected.
    pub fn record(&self, record: AuditRecord) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(error) = sink.write(record).await {
                warn!(%error, "audit sink write failed");
            }
        });
    }
}
