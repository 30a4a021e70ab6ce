//! Reflection policy.
//!
//! Converts a raw step outcome (error string, before/after snapshots,
//! retry count) into one of the five verdicts. Failures are handled
//! locally here; only Abort escalates to the run.

use pilot_core::{ActionKind, ActionStep, DomSnapshot, ReflectionResult};
use tracing::debug;

/// Target categories that are safe to skip once retries are exhausted:
/// consent chrome, marketing popups, support widgets. Matched
/// case-insensitively as substrings of the step target.
const OPTIONAL_TARGET_HINTS: &[&str] = &[
    "cookie",
    "consent",
    "accept",
    "gdpr",
    "privacy",
    "agree",
    "terms",
    "tos",
    "legal",
    "newsletter",
    "popup",
    "dismiss",
    "close-modal",
    "no-thanks",
    "chat-widget",
    "chatbot",
    "live-chat",
    "ad-feedback",
    "ad-choice",
];

/// Wait injected before retrying a timed-out step, milliseconds.
const TIMEOUT_REPAIR_WAIT_MS: u64 = 3000;
/// Wait injected when a navigation produced no URL yet, milliseconds.
const NAVIGATION_SETTLE_MS: u64 = 2000;
/// Wait before re-trying a click that did not change the DOM, milliseconds.
const CLICK_SETTLE_MS: u64 = 1000;

/// Stateless verdict policy.
#[derive(Debug, Clone, Copy)]
pub struct Reflector {
    max_retries: u32,
}

impl Reflector {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide what happens to `step` given its outcome.
    pub fn reflect(
        &self,
        step: &ActionStep,
        before: &DomSnapshot,
        after: Option<&DomSnapshot>,
        error: Option<&str>,
        retry_count: u32,
    ) -> ReflectionResult {
        match (error, after) {
            (Some(error), _) => self.handle_failure(step, error, retry_count),
            (None, None) => self.handle_failure(step, "no snapshot after execution", retry_count),
            (None, Some(after)) => self.verify(step, before, after, retry_count),
        }
    }

    fn handle_failure(&self, step: &ActionStep, error: &str, retry_count: u32) -> ReflectionResult {
        debug!(step_id = %step.id, error, retry_count, "reflecting on step failure");

        if retry_count >= self.max_retries {
            if Self::is_optional_target(&step.target) {
                return ReflectionResult::skip(format!(
                    "optional step '{}' failed after {retry_count} retries: {error}",
                    step.target
                ));
            }
            return ReflectionResult::abort(format!(
                "step '{}' failed after {retry_count} retries: {error}",
                step.target
            ));
        }

        let lowered = error.to_lowercase();
        if Self::is_not_found_error(&lowered) {
            // Clear the selector so the resolver runs again on the next pop.
            return ReflectionResult::retry(
                format!("element not found: {error}"),
                vec![step.without_selector()],
            );
        }

        if lowered.contains("timeout") || lowered.contains("timed out") {
            let mut settle = ActionStep::new(ActionKind::Wait, "let the page settle");
            settle.value = Some(TIMEOUT_REPAIR_WAIT_MS.to_string());
            return ReflectionResult::retry(
                format!("timeout: {error}"),
                vec![settle, step.clone()],
            );
        }

        ReflectionResult::retry(error.to_string(), vec![step.clone()])
    }

    fn verify(
        &self,
        step: &ActionStep,
        before: &DomSnapshot,
        after: &DomSnapshot,
        retry_count: u32,
    ) -> ReflectionResult {
        match step.action {
            ActionKind::Navigate => {
                if after.url.is_empty() {
                    let mut settle = ActionStep::new(ActionKind::Wait, "wait for page load");
                    settle.value = Some(NAVIGATION_SETTLE_MS.to_string());
                    ReflectionResult::retry(
                        "navigation produced no url".to_string(),
                        vec![settle, step.clone()],
                    )
                } else {
                    ReflectionResult::success(step.selector.clone())
                }
            }
            ActionKind::Click => {
                if before.content != after.content {
                    ReflectionResult::success(step.selector.clone())
                } else if retry_count >= self.max_retries {
                    // Some clicks (analytics beacons, downloads) never touch
                    // the DOM; after enough tries, take the click at face value.
                    ReflectionResult::success(step.selector.clone())
                } else {
                    ReflectionResult::wait("click produced no visible change", CLICK_SETTLE_MS)
                }
            }
            ActionKind::Type => {
                // A masked input (password) changes nothing visible; typing
                // is trusted either way, unconfirmed entries just get logged.
                let confirmed = step
                    .value
                    .as_deref()
                    .map(|v| after.content.contains(v))
                    .unwrap_or(false)
                    || before.content != after.content;
                if !confirmed {
                    debug!(step_id = %step.id, "typed value not visible; assuming masked input");
                }
                ReflectionResult::success(step.selector.clone())
            }
            _ => ReflectionResult::success(step.selector.clone()),
        }
    }

    fn is_optional_target(target: &str) -> bool {
        let lowered = target.to_lowercase();
        OPTIONAL_TARGET_HINTS
            .iter()
            .any(|hint| lowered.contains(hint))
    }

    fn is_not_found_error(lowered_error: &str) -> bool {
        lowered_error.contains("element not found")
            || lowered_error.contains("selector")
            || lowered_error.contains("unable to locate")
            || lowered_error.contains("no such element")
    }
}
