//! Run executor.
//!
//! Drives one `TestRun` from admission to a terminal state. Key
//! responsibilities:
//! - Pre-flight goal screening before any resource is acquired
//! - Wall-clock deadline from the first acquired resource onward
//! - Browser context acquisition with restart retries
//! - Plan generation, sanitization and domain verification
//! - Guaranteed cleanup on every path past acquisition, panics included
//! - One completion event per run

use crate::bridge::{ensure_clean_context, BridgePort};
use crate::planner::{PlanError, Planner};
use crate::safety::{PlanSanitizer, TargetGuard};
use crate::sleeper::Sleeper;
use crate::steps::{LoopExit, StepLoop};
use crate::store::{CompletionSink, EventSink, RunStore};
use chrono::Utc;
use futures_util::FutureExt;
use pilot_core::events::{
    RunCompletedPayload, RunCompletionEvent, RunFailedPayload, RunStartedPayload,
};
use pilot_core::prompt::PromptInjectionDetector;
use pilot_core::{
    ActionQueue, Config, DoneQueue, Event, EventType, FailureKind, RunStatus, TestRun,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Executes runs end to end. One instance serves many concurrent runs;
/// each `execute` call owns its run exclusively.
pub struct RunExecutor {
    bridge: Arc<dyn BridgePort>,
    planner: Planner,
    step_loop: StepLoop,
    guard: TargetGuard,
    plan_sanitizer: PlanSanitizer,
    injection_detector: PromptInjectionDetector,
    run_store: Arc<dyn RunStore>,
    completion_sink: Arc<dyn CompletionSink>,
    events: Arc<dyn EventSink>,
    config: Config,
}

impl std::fmt::Debug for RunExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunExecutor").finish_non_exhaustive()
    }
}

impl RunExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bridge: Arc<dyn BridgePort>,
        planner: Planner,
        step_loop: StepLoop,
        guard: TargetGuard,
        plan_sanitizer: PlanSanitizer,
        run_store: Arc<dyn RunStore>,
        completion_sink: Arc<dyn CompletionSink>,
        events: Arc<dyn EventSink>,
        config: Config,
    ) -> Self {
        Self {
            bridge,
            planner,
            step_loop,
            guard,
            plan_sanitizer,
            injection_detector: PromptInjectionDetector::new(),
            run_store,
            completion_sink,
            events,
            config,
        }
    }

    /// Execute a run to its terminal state. Mutates status and executed
    /// steps; emits exactly one completion event.
    pub async fn execute(&self, run: &mut TestRun) {
        info!(run_id = %run.id, tenant_id = %run.tenant_id, url = %run.target_url, "executing run");

        // Pre-flight: nothing acquired yet, so a rejection returns without
        // touching the bridge.
        if !self.injection_detector.are_safe(&run.goals) {
            fail(run, FailureKind::SecurityRejection, "prompt injection pattern detected in goals");
            self.finish(run).await;
            return;
        }
        if let Err(violation) = self.guard.check(&run.target_url).await {
            fail(run, FailureKind::SecurityRejection, violation);
            self.finish(run).await;
            return;
        }

        let start = Instant::now();
        let deadline = start + self.config.run_deadline();
        let cancel = CancellationToken::new();
        let sleeper = Sleeper::new(cancel.clone());

        // From here on, cleanup must run exactly once on every exit,
        // including a panicking step loop.
        let inner = AssertUnwindSafe(self.execute_inner(run, &sleeper, start, deadline))
            .catch_unwind()
            .await;
        cancel.cancel();

        if let Err(panic) = inner {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(run_id = %run.id, %message, "run executor panicked");
            fail(run, FailureKind::SystemError, format!("panic: {message}"));
        }

        self.cleanup(run).await;
        self.finish(run).await;
    }

    /// Everything between resource acquisition and cleanup.
    async fn execute_inner(
        &self,
        run: &mut TestRun,
        sleeper: &Sleeper,
        start: Instant,
        deadline: Instant,
    ) {
        // Acquire an isolated browser context, restarting the bridge
        // between attempts.
        if let Err(error) = ensure_clean_context(
            self.bridge.as_ref(),
            self.config.bridge_headless,
            &run.id,
            self.config.bridge_context_retries,
        )
        .await
        {
            fail(
                run,
                FailureKind::SystemError,
                format!("browser context acquisition failed: {error}"),
            );
            return;
        }

        if deadline_breached(run, start, deadline, "context creation") {
            return;
        }

        // Plan.
        let raw_steps = match self
            .planner
            .plan(&run.target_url, &run.goals, &run.persona)
            .await
        {
            Ok(steps) => steps,
            Err(PlanError::PromptTooLarge) => {
                fail(
                    run,
                    FailureKind::SecurityRejection,
                    "planner input exceeds the prompt budget",
                );
                return;
            }
            Err(error) => {
                fail(run, FailureKind::SystemError, format!("planning failed: {error}"));
                return;
            }
        };

        if deadline_breached(run, start, deadline, "planning") {
            return;
        }

        // Sanitize, then verify the plan stays on the target's domain.
        let allowed_domain = crate::safety::extract_host(&run.target_url)
            .map(|h| crate::safety::normalize_host(&h))
            .unwrap_or_default();
        let steps = self.plan_sanitizer.sanitize(raw_steps, &allowed_domain);
        if steps.is_empty() {
            fail(run, FailureKind::PlanEmpty, "sanitization left no executable steps");
            return;
        }
        if !self.plan_sanitizer.is_safe(&steps, &allowed_domain) {
            fail(
                run,
                FailureKind::SecurityRejection,
                "plan navigates outside the allowed domain",
            );
            return;
        }

        // Begin.
        run.status = RunStatus::Running;
        run.updated_at = Utc::now();
        if let Err(error) = self.run_store.save(run).await {
            fail(run, FailureKind::SystemError, format!("persisting run failed: {error}"));
            return;
        }
        self.events
            .append(Event::new(
                run.id.clone(),
                EventType::RunStarted,
                &RunStartedPayload {
                    run_id: run.id.clone(),
                    tenant_id: run.tenant_id.clone(),
                    target_url: run.target_url.clone(),
                    goal_count: run.goals.len(),
                },
            ))
            .await;
        let mut queue = ActionQueue::new();
        queue.push_all(steps);
        let mut done = DoneQueue::new();

        match self
            .step_loop
            .run(run, &mut queue, &mut done, sleeper, start, deadline)
            .await
        {
            Ok(LoopExit::QueueExhausted) => {
                if run.status == RunStatus::Running {
                    run.status = RunStatus::Completed;
                    run.updated_at = Utc::now();
                }
            }
            Ok(LoopExit::IterationCap { iterations }) => {
                fail(
                    run,
                    FailureKind::IterationCap,
                    format!("loop exceeded {} iterations", iterations - 1),
                );
            }
            Ok(LoopExit::DeadlineExceeded { elapsed }) => {
                fail(
                    run,
                    FailureKind::Timeout,
                    format!("step-loop phase after {}", format_elapsed(elapsed)),
                );
            }
            Ok(LoopExit::Aborted { reason }) => {
                fail(run, FailureKind::Aborted, reason);
            }
            Err(error) => {
                fail(
                    run,
                    FailureKind::SystemError,
                    format!("step loop error: {error}"),
                );
            }
        }
    }

    /// Close the run's browser context; restart the bridge if the close
    /// fails. Never raises.
    async fn cleanup(&self, run: &TestRun) {
        if let Err(error) = self.bridge.close_context(&run.id).await {
            warn!(run_id = %run.id, %error, "context close failed; restarting bridge");
            if let Err(error) = self.bridge.force_restart().await {
                error!(run_id = %run.id, %error, "bridge restart during cleanup failed");
            }
        }
    }

    /// Persist the terminal state and publish the completion event.
    async fn finish(&self, run: &mut TestRun) {
        run.updated_at = Utc::now();
        if let Err(error) = self.run_store.save(run).await {
            error!(run_id = %run.id, %error, "persisting terminal run state failed");
        }
        info!(
            run_id = %run.id,
            status = run.status.as_str(),
            reason = run.failure_reason.as_deref().unwrap_or("-"),
            steps = run.executed_steps.len(),
            "run finished"
        );
        let event = match run.status {
            RunStatus::Failed => Event::new(
                run.id.clone(),
                EventType::RunFailed,
                &RunFailedPayload {
                    run_id: run.id.clone(),
                    reason: run.failure_reason.clone().unwrap_or_default(),
                },
            ),
            _ => Event::new(
                run.id.clone(),
                EventType::RunCompleted,
                &RunCompletedPayload {
                    run_id: run.id.clone(),
                    executed_step_count: run.executed_steps.len(),
                },
            ),
        };
        self.events.append(event).await;
        self.completion_sink
            .publish(RunCompletionEvent {
                run_id: run.id.clone(),
                tenant_id: run.tenant_id.clone(),
                status: run.status,
                failure_reason: run.failure_reason.clone(),
                executed_step_count: run.executed_steps.len(),
                finished_at: Utc::now(),
            })
            .await;
    }
}

fn fail(run: &mut TestRun, kind: FailureKind, description: impl std::fmt::Display) {
    run.status = RunStatus::Failed;
    run.failure_reason = Some(kind.reason(description));
    run.updated_at = Utc::now();
}

/// Check the wall clock; on breach, fail the run with the phase name and
/// elapsed time. The comparison is strictly after the deadline.
fn deadline_breached(run: &mut TestRun, start: Instant, deadline: Instant, phase: &str) -> bool {
    let now = Instant::now();
    if now > deadline {
        let elapsed = now.duration_since(start);
        fail(
            run,
            FailureKind::Timeout,
            format!("{phase} phase after {}", format_elapsed(elapsed)),
        );
        return true;
    }
    false
}

fn format_elapsed(elapsed: std::time::Duration) -> String {
    let total_secs = elapsed.as_secs();
    let minutes = total_secs / 60;
    let seconds = total_secs % 60;
    if minutes > 0 {
        format!("{minutes} min {seconds} sec")
    } else {
        format!("{seconds} sec")
    }
}
