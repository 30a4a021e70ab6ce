//! Step loop.
//!
//! Drives one run's action queue to exhaustion: snapshot, clear obstacles,
//! resolve the selector, call the bridge, snapshot again, reflect, and
//! dispatch the verdict. Multi-axis termination: queue exhaustion,
//! iteration cap, wall-clock deadline, abort verdict.

use crate::ai::{ChatPort, SUGGESTION_TEMPERATURE};
use crate::bridge::{BridgeError, BridgePort, ToolResult};
use crate::obstacles::ObstacleClearer;
use crate::reflector::Reflector;
use crate::resolver::{Resolution, SelectorResolver};
use crate::sleeper::Sleeper;
use crate::store::{EventSink, RunStore, ScreenshotStore, StoreError};
use pilot_core::events::{ObstacleDismissedPayload, StepFinishedPayload};
use pilot_core::{
    ActionKind, ActionQueue, ActionStep, Config, DomSnapshot, DoneQueue, Event, EventType,
    ExecutedStep, Id, PerformanceMetrics, ReflectionResult, StepDisposition, TestRun,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, LoopError>;

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// All steps consumed.
    QueueExhausted,
    /// Iteration safety net tripped.
    IterationCap { iterations: u32 },
    /// Wall clock ran out mid-loop.
    DeadlineExceeded { elapsed: Duration },
    /// A reflection verdict gave up on the run.
    Aborted { reason: String },
}

/// Per-run execution engine. One instance serves many runs; all per-run
/// state lives in the loop frame.
pub struct StepLoop {
    bridge: Arc<dyn BridgePort>,
    chat: Arc<dyn ChatPort>,
    resolver: Arc<SelectorResolver>,
    clearer: ObstacleClearer,
    reflector: Reflector,
    run_store: Arc<dyn RunStore>,
    screenshot_store: Arc<dyn ScreenshotStore>,
    events: Arc<dyn EventSink>,
    config: Config,
}

impl std::fmt::Debug for StepLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepLoop").finish_non_exhaustive()
    }
}

impl StepLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bridge: Arc<dyn BridgePort>,
        chat: Arc<dyn ChatPort>,
        resolver: Arc<SelectorResolver>,
        clearer: ObstacleClearer,
        reflector: Reflector,
        run_store: Arc<dyn RunStore>,
        screenshot_store: Arc<dyn ScreenshotStore>,
        events: Arc<dyn EventSink>,
        config: Config,
    ) -> Self {
        Self {
            bridge,
            chat,
            resolver,
            clearer,
            reflector,
            run_store,
            screenshot_store,
            events,
            config,
        }
    }

    /// Drive the queue until a termination axis fires.
    ///
    /// `done` receives every record, auto-dismissals interleaved with
    /// planned steps in execution order; `run.executed_steps` mirrors it
    /// at each sync point.
    pub async fn run(
        &self,
        run: &mut TestRun,
        queue: &mut ActionQueue,
        done: &mut DoneQueue,
        sleeper: &Sleeper,
        start: Instant,
        deadline: Instant,
    ) -> Result<LoopExit> {
        let mut iterations: u32 = 0;
        let mut retries: HashMap<Id, u32> = HashMap::new();
        let mut dismissed_types: HashSet<String> = HashSet::new();

        while !run.status.is_terminal() {
            iterations += 1;
            if iterations > self.config.max_loop_iterations {
                sync_records(run, done);
                return Ok(LoopExit::IterationCap { iterations });
            }
            let now = Instant::now();
            if now > deadline {
                sync_records(run, done);
                return Ok(LoopExit::DeadlineExceeded {
                    elapsed: now.duration_since(start),
                });
            }

            let Some(step) = queue.pop() else {
                sync_records(run, done);
                return Ok(LoopExit::QueueExhausted);
            };
            let retry_count = retries.get(&step.id).copied().unwrap_or(0);
            let step_started = Instant::now();

            // Observe, then clear whatever is in the way.
            let before = self.snapshot_or_empty(run).await;
            let mut auto_records = Vec::new();
            let before = self
                .clearer
                .clear(
                    self.bridge.as_ref(),
                    &run.id,
                    sleeper,
                    before,
                    &mut dismissed_types,
                    &mut auto_records,
                )
                .await;
            for record in auto_records {
                self.events
                    .append(Event::new(
                        run.id.clone(),
                        EventType::ObstacleDismissed,
                        &ObstacleDismissedPayload {
                            run_id: run.id.clone(),
                            obstacle_type: record
                                .step
                                .target
                                .trim_start_matches("Auto-dismiss: ")
                                .to_string(),
                            selector: record.selector_used.clone().unwrap_or_default(),
                        },
                    ))
                    .await;
                done.push(record);
            }

            let outcome = self.execute_step(run, &step, &before, sleeper).await;

            let verdict = self.reflector.reflect(
                &outcome.step,
                &before,
                outcome.after.as_ref(),
                outcome.error.as_deref(),
                retry_count,
            );
            debug!(
                run_id = %run.id,
                step_id = %step.id,
                verdict = verdict.as_str(),
                retry_count,
                "step reflected"
            );

            let duration_ms = step_started.elapsed().as_millis() as u64;
            match verdict {
                ReflectionResult::Success { selector } => {
                    let suggestion = self.suggest(&outcome.step).await;
                    let record = ExecutedStep {
                        step: outcome.step.clone(),
                        selector_used: selector.clone(),
                        before: Some(before),
                        after: outcome.after,
                        duration_ms,
                        retry_count,
                        disposition: StepDisposition::Success,
                        reason: None,
                        suggestion,
                        console_logs: outcome.console_logs,
                        page_errors: outcome.page_errors,
                        metrics: outcome.metrics,
                        executed_at: chrono::Utc::now(),
                    };
                    self.log_step_finished(run, &record).await;
                    done.push(record);
                    let step_index = done.len() - 1;
                    self.save_screenshot(run, step_index).await;
                    self.persist(run, done).await?;
                    retries.remove(&step.id);
                    if let (Some(selector), false) = (&selector, step.target.trim().is_empty()) {
                        self.resolver
                            .record_outcome(&run.tenant_id, &step.target, &run.target_url, selector, true)
                            .await;
                    }
                }
                ReflectionResult::Retry {
                    reason,
                    repair_steps,
                } => {
                    info!(run_id = %run.id, step_id = %step.id, %reason, "retrying step");
                    queue.push_all(repair_steps);
                    retries.insert(step.id.clone(), retry_count + 1);
                    if let (Some(selector), false) =
                        (&outcome.step.selector, step.target.trim().is_empty())
                    {
                        self.resolver
                            .record_outcome(&run.tenant_id, &step.target, &run.target_url, selector, false)
                            .await;
                    }
                }
                ReflectionResult::Wait { reason, ms } => {
                    info!(run_id = %run.id, step_id = %step.id, %reason, ms, "waiting before retry");
                    sleeper.sleep_ms(ms).await;
                    // Re-push with the latest resolved selector so the next
                    // attempt skips re-resolution.
                    queue.push(outcome.step.clone());
                    retries.insert(step.id.clone(), retry_count + 1);
                }
                ReflectionResult::Abort { reason } => {
                    let suggestion = self.suggest(&outcome.step).await;
                    let record = ExecutedStep {
                        step: outcome.step.clone(),
                        selector_used: outcome.step.selector.clone(),
                        before: Some(before),
                        after: outcome.after,
                        duration_ms,
                        retry_count,
                        disposition: StepDisposition::Failed,
                        reason: Some(format!("Aborted: {reason}")),
                        suggestion,
                        console_logs: outcome.console_logs,
                        page_errors: outcome.page_errors,
                        metrics: outcome.metrics,
                        executed_at: chrono::Utc::now(),
                    };
                    self.log_step_finished(run, &record).await;
                    done.push(record);
                    self.persist(run, done).await?;
                    return Ok(LoopExit::Aborted { reason });
                }
                ReflectionResult::Skip { reason } => {
                    let record = ExecutedStep {
                        step: outcome.step.clone(),
                        selector_used: outcome.step.selector.clone(),
                        before: Some(before),
                        after: outcome.after,
                        duration_ms,
                        retry_count,
                        disposition: StepDisposition::Skipped,
                        reason: Some(reason),
                        suggestion: None,
                        console_logs: outcome.console_logs,
                        page_errors: outcome.page_errors,
                        metrics: outcome.metrics,
                        executed_at: chrono::Utc::now(),
                    };
                    self.log_step_finished(run, &record).await;
                    done.push(record);
                    self.persist(run, done).await?;
                    retries.remove(&step.id);
                }
            }
        }

        sync_records(run, done);
        Ok(LoopExit::QueueExhausted)
    }

    /// Resolve and execute one step against the bridge.
    async fn execute_step(
        &self,
        run: &TestRun,
        step: &ActionStep,
        before: &DomSnapshot,
        sleeper: &Sleeper,
    ) -> StepOutcome {
        let resolution = self
            .resolver
            .resolve(&run.tenant_id, step, &run.target_url, before)
            .await;

        let resolved = match resolution {
            Resolution::Resolved(resolved) => resolved,
            Resolution::Unresolved => {
                // Navigation and waits need no element; everything else goes
                // to the reflector as a lookup failure.
                if requires_selector(step.action) {
                    return StepOutcome::failed(
                        step.clone(),
                        "element not found: no selector could be resolved",
                    );
                }
                step.clone()
            }
        };

        // Region screenshots scroll into place first.
        if resolved.action == ActionKind::Screenshot && screenshot_needs_scroll(&resolved.target) {
            let script = scroll_script_for(&resolved.target);
            if let Err(error) = self
                .bridge
                .call_tool(&run.id, "evaluate", json!({ "script": script }))
                .await
            {
                warn!(run_id = %run.id, %error, "pre-screenshot scroll failed");
            }
            sleeper.sleep_ms(250).await;
        }

        let tool = resolved.action.tool_name();
        let arguments = build_tool_arguments(&resolved);
        let call = self.bridge.call_tool(&run.id, tool, arguments).await;

        match call {
            Ok(result) => {
                let metrics = if resolved.action == ActionKind::MeasurePerformance {
                    parse_metrics(&result.value)
                } else {
                    None
                };
                let after = self.bridge.snapshot(&run.id).await.ok();
                StepOutcome {
                    step: resolved,
                    error: None,
                    after,
                    console_logs: result.console_logs,
                    page_errors: result.page_errors,
                    metrics,
                }
            }
            Err(error) => {
                let message = bridge_error_message(&error);
                StepOutcome::failed(resolved, &message)
            }
        }
    }

    async fn snapshot_or_empty(&self, run: &TestRun) -> DomSnapshot {
        match self.bridge.snapshot(&run.id).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(run_id = %run.id, %error, "snapshot failed; using empty snapshot");
                DomSnapshot::empty()
            }
        }
    }

    /// Ask for an optimization suggestion; empty answers collapse to None.
    async fn suggest(&self, step: &ActionStep) -> Option<String> {
        let user_prompt = format!(
            "Step executed: action={}, target={}, selector={}. Offer one short \
             optimization suggestion for this test step, or reply with nothing.",
            step.action.as_str(),
            step.target,
            step.selector.as_deref().unwrap_or("-"),
        );
        let response = self
            .chat
            .call(
                "You review browser test steps and suggest small improvements.",
                &user_prompt,
                Some(SUGGESTION_TEMPERATURE),
            )
            .await
            .ok()?;
        let trimmed = response.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    async fn save_screenshot(&self, run: &TestRun, step_index: usize) {
        let result = self
            .bridge
            .call_tool(&run.id, "take_screenshot", json!({}))
            .await;
        match result {
            Ok(ToolResult {
                image: Some(bytes), ..
            }) => {
                if let Err(error) = self
                    .screenshot_store
                    .save(&run.id, step_index, &bytes)
                    .await
                {
                    warn!(run_id = %run.id, step_index, %error, "screenshot save failed");
                }
            }
            Ok(_) => {}
            Err(error) => {
                warn!(run_id = %run.id, step_index, %error, "screenshot capture failed");
            }
        }
    }

    async fn log_step_finished(&self, run: &TestRun, record: &ExecutedStep) {
        self.events
            .append(Event::new(
                run.id.clone(),
                EventType::StepFinished,
                &StepFinishedPayload {
                    run_id: run.id.clone(),
                    step_id: record.step.id.clone(),
                    disposition: record.disposition,
                    retry_count: record.retry_count,
                    duration_ms: record.duration_ms,
                },
            ))
            .await;
    }

    async fn persist(&self, run: &mut TestRun, done: &DoneQueue) -> Result<()> {
        sync_records(run, done);
        run.updated_at = chrono::Utc::now();
        self.run_store.save(run).await?;
        Ok(())
    }
}

/// Mirror the done queue into the run's embedded step log.
fn sync_records(run: &mut TestRun, done: &DoneQueue) {
    run.executed_steps = done.records().to_vec();
}

/// Outcome of one tool invocation, pre-reflection.
#[derive(Debug)]
struct StepOutcome {
    step: ActionStep,
    error: Option<String>,
    after: Option<DomSnapshot>,
    console_logs: Vec<String>,
    page_errors: Vec<String>,
    metrics: Option<PerformanceMetrics>,
}

impl StepOutcome {
    fn failed(step: ActionStep, error: &str) -> Self {
        Self {
            step,
            error: Some(error.to_string()),
            after: None,
            console_logs: Vec::new(),
            page_errors: Vec::new(),
            metrics: None,
        }
    }
}

fn bridge_error_message(error: &BridgeError) -> String {
    match error {
        BridgeError::Timeout(d) => format!("bridge call timed out after {d:?}"),
        other => other.to_string(),
    }
}

/// Actions that cannot run without a concrete element.
fn requires_selector(action: ActionKind) -> bool {
    matches!(
        action,
        ActionKind::Click | ActionKind::Type | ActionKind::Hover
    )
}

/// Assemble `tools/call` arguments for a resolved step.
pub fn build_tool_arguments(step: &ActionStep) -> Value {
    let mut args = serde_json::Map::new();

    match step.action {
        ActionKind::Navigate => {
            args.insert(
                "url".to_string(),
                Value::String(step.value.clone().unwrap_or_default()),
            );
        }
        ActionKind::Wait => {
            return wait_arguments(step);
        }
        ActionKind::Scroll => {
            args.insert(
                "script".to_string(),
                Value::String(scroll_script_for(&step.target)),
            );
        }
        _ => {
            if let Some(selector) = &step.selector {
                args.insert("selector".to_string(), Value::String(selector.clone()));
            }
            if let Some(value) = &step.value {
                args.insert("value".to_string(), Value::String(value.clone()));
            }
        }
    }

    for (key, value) in &step.params {
        args.entry(key.clone())
            .or_insert_with(|| Value::String(value.clone()));
    }
    Value::Object(args)
}

/// Normalize wait parameters: a bare timeout becomes an `ms` sleep; other
/// values pass through as a wait condition.
fn wait_arguments(step: &ActionStep) -> Value {
    if let Some(timeout) = step.params.get("timeout") {
        if let Ok(ms) = timeout.parse::<u64>() {
            return json!({ "ms": ms });
        }
    }
    if let Some(value) = &step.value {
        if let Ok(ms) = value.parse::<u64>() {
            return json!({ "ms": ms });
        }
        return json!({ "condition": value });
    }
    json!({ "ms": 1000 })
}

/// True when a screenshot target names a page region and needs a scroll
/// before capture.
pub fn screenshot_needs_scroll(target: &str) -> bool {
    let lowered = target.to_lowercase();
    lowered.contains("bottom")
        || lowered.contains("footer")
        || lowered.contains("middle")
        || lowered.contains("section")
        || lowered.contains('%')
        || lowered.contains("px")
        || lowered.split_whitespace().any(|w| w.parse::<u64>().is_ok())
}

/// Synthesize a scroll script from a natural-language target.
pub fn scroll_script_for(target: &str) -> String {
    let lowered = target.to_lowercase();

    if lowered.contains("top") {
        return "window.scrollTo(0, 0)".to_string();
    }
    if lowered.contains("bottom") || lowered.contains("footer") || lowered.contains("end") {
        return "window.scrollTo(0, document.body.scrollHeight)".to_string();
    }
    if lowered.contains("middle") || lowered.contains("half") {
        return "window.scrollTo(0, document.body.scrollHeight / 2)".to_string();
    }
    if let Some(percent) = lowered
        .split('%')
        .next()
        .and_then(|s| s.split_whitespace().last())
        .and_then(|s| s.parse::<f64>().ok())
    {
        if lowered.contains('%') {
            let fraction = (percent / 100.0).clamp(0.0, 1.0);
            return format!(
                "window.scrollTo(0, document.body.scrollHeight * {fraction})"
            );
        }
    }
    if let Some(pixels) = lowered
        .split("px")
        .next()
        .and_then(|s| s.split_whitespace().last())
        .and_then(|s| s.parse::<u64>().ok())
    {
        if lowered.contains("px") {
            return format!("window.scrollBy(0, {pixels})");
        }
    }
    // One viewport down by default.
    "window.scrollBy(0, window.innerHeight)".to_string()
}

/// Pull web-vitals out of an unwrapped `get_performance_metrics` payload.
pub fn parse_metrics(value: &Value) -> Option<PerformanceMetrics> {
    let vitals = value.get("webVitals").unwrap_or(value);
    let metric = |name: &str| vitals.get(name).and_then(Value::as_f64);
    let metrics = PerformanceMetrics {
        lcp: metric("lcp"),
        cls: metric("cls"),
        fcp: metric("fcp"),
        ttfb: metric("ttfb"),
    };
    if metrics == PerformanceMetrics::default() {
        None
    } else {
        Some(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(action: ActionKind, target: &str) -> ActionStep {
        ActionStep::new(action, target)
    }

    #[test]
    fn navigate_arguments_carry_url() {
        let s = step(ActionKind::Navigate, "").with_value("https://example.com");
        let args = build_tool_arguments(&s);
        assert_eq!(args["url"], json!("https://example.com"));
    }

    #[test]
    fn click_arguments_carry_selector() {
        let s = step(ActionKind::Click, "Login").with_selector("button#login");
        let args = build_tool_arguments(&s);
        assert_eq!(args["selector"], json!("button#login"));
    }

    #[test]
    fn extra_params_are_forwarded() {
        let mut s = step(ActionKind::Click, "Login").with_selector("#x");
        s.params.insert("button".to_string(), "right".to_string());
        let args = build_tool_arguments(&s);
        assert_eq!(args["button"], json!("right"));
    }

    #[test]
    fn wait_bare_timeout_becomes_ms() {
        let mut s = step(ActionKind::Wait, "");
        s.params.insert("timeout".to_string(), "2500".to_string());
        assert_eq!(build_tool_arguments(&s), json!({ "ms": 2500 }));

        let s = step(ActionKind::Wait, "").with_value("1500");
        assert_eq!(build_tool_arguments(&s), json!({ "ms": 1500 }));
    }

    #[test]
    fn wait_condition_passes_through() {
        let s = step(ActionKind::Wait, "").with_value("networkidle");
        assert_eq!(
            build_tool_arguments(&s),
            json!({ "condition": "networkidle" })
        );
    }

    #[test]
    fn scroll_scripts_match_targets() {
        assert_eq!(scroll_script_for("scroll to top"), "window.scrollTo(0, 0)");
        assert_eq!(
            scroll_script_for("scroll to the bottom of the page"),
            "window.scrollTo(0, document.body.scrollHeight)"
        );
        assert_eq!(
            scroll_script_for("the footer"),
            "window.scrollTo(0, document.body.scrollHeight)"
        );
        assert_eq!(
            scroll_script_for("middle of the page"),
            "window.scrollTo(0, document.body.scrollHeight / 2)"
        );
        assert_eq!(
            scroll_script_for("scroll down 500px"),
            "window.scrollBy(0, 500)"
        );
        assert_eq!(
            scroll_script_for("scroll to 75% of the page"),
            "window.scrollTo(0, document.body.scrollHeight * 0.75)"
        );
        assert_eq!(
            scroll_script_for("somewhere vague"),
            "window.scrollBy(0, window.innerHeight)"
        );
    }

    #[test]
    fn screenshot_scroll_detection() {
        assert!(screenshot_needs_scroll("the footer"));
        assert!(screenshot_needs_scroll("bottom of the page"));
        assert!(screenshot_needs_scroll("middle section"));
        assert!(screenshot_needs_scroll("at 50%"));
        assert!(screenshot_needs_scroll("300px down"));
        assert!(!screenshot_needs_scroll("the whole page"));
        assert!(!screenshot_needs_scroll(""));
    }

    #[test]
    fn parse_metrics_reads_web_vitals() {
        let value = json!({
            "success": true,
            "webVitals": { "lcp": 1250.5, "cls": 0.05 }
        });
        let metrics = parse_metrics(&value).unwrap();
        assert_eq!(metrics.lcp, Some(1250.5));
        assert_eq!(metrics.cls, Some(0.05));
        assert_eq!(metrics.fcp, None);
    }

    #[test]
    fn parse_metrics_reads_flat_fields() {
        let value = json!({ "lcp": 900.0, "ttfb": 120.0 });
        let metrics = parse_metrics(&value).unwrap();
        assert_eq!(metrics.lcp, Some(900.0));
        assert_eq!(metrics.ttfb, Some(120.0));
    }

    #[test]
    fn parse_metrics_rejects_empty_payload() {
        assert!(parse_metrics(&json!({ "success": true })).is_none());
        assert!(parse_metrics(&json!({})).is_none());
    }
}
