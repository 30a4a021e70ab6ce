pub mod config;
pub mod events;
pub mod prompt;
pub mod queue;
pub mod types;
pub mod verdict;

pub use config::Config;
pub use events::{AdmissionDecision, AuditRecord, Event, EventType, RunCompletionEvent};
pub use queue::{ActionQueue, DoneQueue};
pub use types::{
    ActionKind, ActionStep, Confidence, DomSnapshot, ExecutedStep, FailureKind, Id, ObstacleInfo,
    PerformanceMetrics, RunStatus, StepDisposition, TestRun,
};
pub use verdict::ReflectionResult;
