//! Event and audit types.
//!
//! Completion events are emitted once per run; admission decisions are
//! written asynchronously to the audit sink and must never fail the
//! admission path.

use crate::types::{Id, RunStatus, StepDisposition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type names for the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    StepFinished,
    ObstacleDismissed,
    RunCompleted,
    RunFailed,
    AdmissionDecision,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "RUN_STARTED",
            Self::StepFinished => "STEP_FINISHED",
            Self::ObstacleDismissed => "OBSTACLE_DISMISSED",
            Self::RunCompleted => "RUN_COMPLETED",
            Self::RunFailed => "RUN_FAILED",
            Self::AdmissionDecision => "ADMISSION_DECISION",
        }
    }
}

/// An entry in the audit event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub run_id: Id,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// JSON payload with event-specific data.
    pub payload_json: String,
}

impl Event {
    pub fn new(run_id: Id, event_type: EventType, payload: &impl Serialize) -> Self {
        Self {
            id: Id::new(),
            run_id,
            event_type,
            timestamp: Utc::now(),
            payload_json: serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string()),
        }
    }
}

/// Payload for `RUN_STARTED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: Id,
    pub tenant_id: String,
    pub target_url: String,
    pub goal_count: usize,
}

/// Payload for `STEP_FINISHED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFinishedPayload {
    pub run_id: Id,
    pub step_id: Id,
    pub disposition: StepDisposition,
    pub retry_count: u32,
    pub duration_ms: u64,
}

/// Payload for `OBSTACLE_DISMISSED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObstacleDismissedPayload {
    pub run_id: Id,
    pub obstacle_type: String,
    pub selector: String,
}

/// Payload for `RUN_COMPLETED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub run_id: Id,
    pub executed_step_count: usize,
}

/// Payload for `RUN_FAILED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailedPayload {
    pub run_id: Id,
    pub reason: String,
}

/// Completion event published at the end of every run, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletionEvent {
    pub run_id: Id,
    pub tenant_id: String,
    pub status: RunStatus,
    pub failure_reason: Option<String>,
    pub executed_step_count: usize,
    pub finished_at: DateTime<Utc>,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDecision {
    Allowed,
    Blocked,
    RateLimited,
}

impl AdmissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Blocked => "blocked",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Audit entry for one admission decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub tenant_id: String,
    pub client_ip: String,
    pub url: String,
    /// Host extracted from `url` at decision time.
    pub extracted_domain: String,
    pub decision: AdmissionDecision,
    pub reason: String,
    /// Heuristic risk score in [0.0, 1.0].
    pub risk_score: f64,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        client_ip: impl Into<String>,
        url: impl Into<String>,
        extracted_domain: impl Into<String>,
        decision: AdmissionDecision,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_ip: client_ip.into(),
            url: url.into(),
            extracted_domain: extracted_domain.into(),
            decision,
            reason: reason.into(),
            risk_score: 0.0,
            user_agent: None,
            request_id: None,
            timestamp: Utc::now(),
        }
    }
}
