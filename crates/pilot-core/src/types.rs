//! Core types for the orchestration daemon.
//!
//! Runs, steps, snapshots and verdict-adjacent value types shared by the
//! daemon and its tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for runs, steps and audit entries.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Run lifecycle status.
///
/// Transitions: Pending -> Running -> (Completed | Failed).
/// Failed is terminal and carries a reason string on the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Atomic browser action kinds the planner may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Type,
    Hover,
    Wait,
    Screenshot,
    Scroll,
    MeasurePerformance,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::Type => "type",
            Self::Hover => "hover",
            Self::Wait => "wait",
            Self::Screenshot => "screenshot",
            Self::Scroll => "scroll",
            Self::MeasurePerformance => "measure_performance",
        }
    }

    /// Bridge tool name this action dispatches to.
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Navigate => "navigate_page",
            Self::Type => "fill",
            Self::Wait => "wait_for",
            Self::Screenshot => "take_screenshot",
            Self::Scroll => "evaluate",
            Self::MeasurePerformance => "get_performance_metrics",
            Self::Click => "click",
            Self::Hover => "hover",
        }
    }
}

/// Outcome recorded for an executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepDisposition {
    Success,
    Failed,
    Skipped,
}

impl StepDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

/// Detector confidence for a reported obstacle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

// --- Core types ---

/// A declarative test driven by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: Id,
    /// Owning tenant; admission and rate limits key off this.
    pub tenant_id: String,
    /// Entry URL for the test.
    pub target_url: String,
    /// Natural-language goals, in order.
    pub goals: Vec<String>,
    /// Planner persona tag (opaque to the orchestrator).
    pub persona: String,
    pub status: RunStatus,
    /// Populated when status is Failed, shaped `<FailureKind>: <description>`.
    pub failure_reason: Option<String>,
    /// Steps executed so far, auto-dismissals interleaved in execution order.
    pub executed_steps: Vec<ExecutedStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TestRun {
    pub fn new(
        tenant_id: impl Into<String>,
        target_url: impl Into<String>,
        goals: Vec<String>,
        persona: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new(),
            tenant_id: tenant_id.into(),
            target_url: target_url.into(),
            goals,
            persona: persona.into(),
            status: RunStatus::Pending,
            failure_reason: None,
            executed_steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// An atomic browser instruction.
///
/// Steps are immutable once issued; resolving a selector produces a new
/// step via [`ActionStep::with_selector`]. The step id stays stable across
/// retries so retry counters can be keyed off it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStep {
    pub id: Id,
    pub action: ActionKind,
    /// Natural-language element description; may be blank.
    pub target: String,
    /// Concrete selector, once resolved.
    pub selector: Option<String>,
    /// Value to type / URL to navigate to / milliseconds to wait.
    pub value: Option<String>,
    /// Extra tool parameters forwarded to the bridge.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ActionStep {
    pub fn new(action: ActionKind, target: impl Into<String>) -> Self {
        Self {
            id: Id::new(),
            action,
            target: target.into(),
            selector: None,
            value: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Copy of this step with the selector filled in. Keeps the step id so
    /// retry bookkeeping follows the step, not the resolution.
    pub fn with_selector(&self, selector: impl Into<String>) -> Self {
        let mut step = self.clone();
        step.selector = Some(selector.into());
        step
    }

    /// Copy of this step with the selector cleared, forcing re-resolution
    /// on the next pop.
    pub fn without_selector(&self) -> Self {
        let mut step = self.clone();
        step.selector = None;
        step
    }
}

/// Accessibility-tree snapshot of the page at a point in time.
///
/// `content` is the aria snapshot text with `[ref=e<N>]` anchors; value
/// object, never shared across steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub content: String,
    pub url: String,
    pub title: String,
    pub captured_at: DateTime<Utc>,
}

impl DomSnapshot {
    pub fn new(
        content: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            url: url.into(),
            title: title.into(),
            captured_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new("", "", "")
    }
}

/// Web-vitals style metrics parsed from a `measure_performance` result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Largest contentful paint, milliseconds.
    pub lcp: Option<f64>,
    /// Cumulative layout shift.
    pub cls: Option<f64>,
    /// First contentful paint, milliseconds.
    pub fcp: Option<f64>,
    /// Time to first byte, milliseconds.
    pub ttfb: Option<f64>,
}

/// Record of one executed (or skipped / aborted) step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedStep {
    pub step: ActionStep,
    /// Selector actually used, if any.
    pub selector_used: Option<String>,
    pub before: Option<DomSnapshot>,
    pub after: Option<DomSnapshot>,
    pub duration_ms: u64,
    pub retry_count: u32,
    pub disposition: StepDisposition,
    /// Failure or skip reason when disposition is not Success.
    pub reason: Option<String>,
    /// Optional AI optimization suggestion.
    pub suggestion: Option<String>,
    /// Console messages captured from the bridge during the call.
    #[serde(default)]
    pub console_logs: Vec<String>,
    /// Page errors captured from the bridge during the call.
    #[serde(default)]
    pub page_errors: Vec<String>,
    pub metrics: Option<PerformanceMetrics>,
    pub executed_at: DateTime<Utc>,
}

/// A blocking overlay reported by the obstacle detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObstacleInfo {
    /// Category tag, e.g. `cookie_consent`, `newsletter_popup`.
    pub obstacle_type: String,
    pub description: String,
    /// Selector to click to dismiss.
    pub dismiss_selector: String,
    /// Visible text of the dismiss control, for text-based fallback.
    pub dismiss_text: String,
    pub confidence: Confidence,
}

// --- Failure taxonomy ---

/// Classification of terminal run failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Prompt injection, unsafe plan navigation, or target-guard block.
    SecurityRejection,
    /// Sanitization left no steps.
    PlanEmpty,
    /// Loop iteration count exceeded.
    IterationCap,
    /// Wall-clock deadline exceeded.
    Timeout,
    /// Reflection returned Abort.
    Aborted,
    /// Uncaught error in any phase.
    SystemError,
    /// Admission or rate limit; surfaced synchronously, never as a Failed run.
    LimitExceeded,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecurityRejection => "SecurityRejection",
            Self::PlanEmpty => "PlanEmpty",
            Self::IterationCap => "IterationCap",
            Self::Timeout => "Timeout",
            Self::Aborted => "Aborted",
            Self::SystemError => "SystemError",
            Self::LimitExceeded => "LimitExceeded",
        }
    }

    /// Format a terminal failure reason as stored on the run.
    pub fn reason(&self, description: impl std::fmt::Display) -> String {
        format!("{}: {}", self.as_str(), description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn run_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Running).unwrap(),
            "\"RUNNING\""
        );
        assert_eq!(
            serde_json::to_string(&RunStatus::Pending).unwrap(),
            "\"PENDING\""
        );
    }

    #[test]
    fn run_status_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn action_kind_tool_mapping() {
        assert_eq!(ActionKind::Navigate.tool_name(), "navigate_page");
        assert_eq!(ActionKind::Type.tool_name(), "fill");
        assert_eq!(ActionKind::Wait.tool_name(), "wait_for");
        assert_eq!(ActionKind::Screenshot.tool_name(), "take_screenshot");
        assert_eq!(ActionKind::Scroll.tool_name(), "evaluate");
        assert_eq!(
            ActionKind::MeasurePerformance.tool_name(),
            "get_performance_metrics"
        );
        // Click and hover pass through under their own names.
        assert_eq!(ActionKind::Click.tool_name(), "click");
        assert_eq!(ActionKind::Hover.tool_name(), "hover");
    }

    #[test]
    fn with_selector_keeps_step_id() {
        let step = ActionStep::new(ActionKind::Click, "Login button");
        let resolved = step.with_selector("button#login");
        assert_eq!(step.id, resolved.id);
        assert_eq!(resolved.selector.as_deref(), Some("button#login"));
        assert!(step.selector.is_none());
    }

    #[test]
    fn without_selector_clears_resolution() {
        let step = ActionStep::new(ActionKind::Click, "Login").with_selector("button#login");
        let repaired = step.without_selector();
        assert_eq!(step.id, repaired.id);
        assert!(repaired.selector.is_none());
    }

    #[test]
    fn failure_kind_reason_format() {
        assert_eq!(
            FailureKind::Timeout.reason("step-loop phase after 30m"),
            "Timeout: step-loop phase after 30m"
        );
        assert_eq!(
            FailureKind::SecurityRejection.reason("blocked host"),
            "SecurityRejection: blocked host"
        );
    }

    #[test]
    fn new_run_starts_pending() {
        let run = TestRun::new("tenant-1", "https://example.com", vec![], "standard");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.failure_reason.is_none());
        assert!(run.executed_steps.is_empty());
    }
}
