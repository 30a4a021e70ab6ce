//! Obstacle clearing.
//!
//! Before a planned step executes, blocking overlays (consent banners, TOS
//! dialogs, newsletter popups) are detected and dismissed, then verified
//! gone by re-detection on the next loop turn. Bookkeeping:
//! - `dismissed_types` (run-scoped) stops re-dismissal across steps,
//! - a per-invocation `attempts` map stops within-step loops,
//! - the `__fallback_selectors_tried__` sentinel limits the selector
//!   fallback pass to once per step.

use crate::ai::{ChatPort, OBSTACLE_DETECTION_TEMPERATURE};
use crate::bridge::BridgePort;
use crate::sleeper::Sleeper;
use once_cell::sync::Lazy;
use pilot_core::prompt::PromptSanitizer;
use pilot_core::{
    ActionKind, ActionStep, Confidence, DomSnapshot, ExecutedStep, Id, ObstacleInfo,
    StepDisposition,
};
use regex::Regex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sentinel stored in `dismissed_types` marking "fallback pass already ran
/// for the current step".
pub const FALLBACK_SENTINEL: &str = "__fallback_selectors_tried__";

/// Delay before clicking, letting entry animations settle, milliseconds.
const PRE_CLICK_SETTLE_MS: u64 = 250;
/// Delay after clicking, letting exit animations settle, milliseconds.
const POST_CLICK_SETTLE_MS: u64 = 500;
/// Within-step dismissal attempts per obstacle type.
const MAX_ATTEMPTS_PER_TYPE: u32 = 2;

const DETECTOR_SYSTEM_PROMPT: &str = "You detect blocking overlays in accessibility-tree snapshots: cookie \
     consent banners, terms-of-service dialogs, newsletter popups, chat \
     widgets that cover content. Respond with a JSON object \
     {\"obstacle_type\": string, \"description\": string, \
     \"dismiss_selector\": string, \"dismiss_text\": string, \
     \"confidence\": \"high\"|\"medium\"|\"low\"} for the most prominent \
     obstacle, or the exact text NONE when nothing blocks interaction.";

/// Selectors for widely-deployed consent frameworks, tried in order.
const FALLBACK_SELECTORS: &[&str] = &[
    // OneTrust
    "#onetrust-accept-btn-handler",
    "#accept-recommended-btn-handler",
    // SourcePoint
    "button.sp_choice_type_11",
    "button[title='Accept All']",
    // Cookiebot
    "#CybotCookiebotDialogBodyLevelButtonLevelOptinAllowAll",
    // ARIA and data-testid heuristics
    "button[aria-label*='accept' i]",
    "[data-testid*='accept']",
    "[data-testid*='consent-accept']",
    // Generic class and id conventions
    ".cookie-accept",
    ".accept-cookies",
    "#acceptCookies",
    "button.consent-accept",
];

static CONTAINS_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#":contains\(\s*['"]?([^'")]+)['"]?\s*\)"#).unwrap());

const JQUERY_PSEUDO_CLASSES: &[&str] = &[
    ":contains", ":has", ":first", ":last", ":eq", ":gt", ":lt", ":even", ":odd",
];

/// Convert jQuery-style pseudo-class selectors into valid CSS.
///
/// `button:contains('Accept All')` becomes
/// `button[aria-label*="Accept All"]`; other pseudo-classes fall back to
/// the detector's dismiss text for the attribute match.
pub fn sanitize_selector(selector: &str, dismiss_text: &str) -> String {
    let has_pseudo = JQUERY_PSEUDO_CLASSES.iter().any(|p| selector.contains(p));
    if !has_pseudo {
        return selector.to_string();
    }

    let text = CONTAINS_TEXT_RE
        .captures(selector)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| dismiss_text.trim().to_string());

    let element: String = selector
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '-')
        .collect();
    let element = if element.is_empty() {
        "button".to_string()
    } else {
        element
    };

    format!("{element}[aria-label*=\"{text}\"]")
}

/// JavaScript click used after a native click failed to remove the
/// obstacle: selector first, text search over clickable elements second.
pub fn js_click_script(selector: &str, dismiss_text: &str) -> String {
    let selector_json = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
    let text_json =
        serde_json::to_string(&dismiss_text.to_lowercase()).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(() => {{
  try {{
    const el = document.querySelector({selector_json});
    if (el) {{ el.click(); return "clicked"; }}
  }} catch (e) {{ /* invalid selector */ }}
  const needle = {text_json};
  if (needle) {{
    const candidates = document.querySelectorAll(
      "button, [role=button], a, input[type=submit], input[type=button]");
    for (const c of candidates) {{
      const text = (c.innerText || c.value || "").trim().toLowerCase();
      if (text === needle || text.includes(needle)) {{
        c.click();
        return "clicked by text";
      }}
    }}
  }}
  return "not found";
}})()"#
    )
}

/// Snippet for the fallback pass: click only when the element is rendered.
fn fallback_click_script(selector: &str) -> String {
    let selector_json = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(() => {{
  try {{
    const el = document.querySelector({selector_json});
    if (el && el.offsetParent !== null) {{ el.click(); return "clicked"; }}
  }} catch (e) {{ /* invalid selector */ }}
  return "not found";
}})()"#
    )
}

/// Detects and dismisses blocking overlays ahead of planned steps.
pub struct ObstacleClearer {
    chat: Arc<dyn ChatPort>,
    sanitizer: PromptSanitizer,
    max_clear_attempts: u32,
}

impl std::fmt::Debug for ObstacleClearer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObstacleClearer")
            .field("max_clear_attempts", &self.max_clear_attempts)
            .finish_non_exhaustive()
    }
}

impl ObstacleClearer {
    pub fn new(chat: Arc<dyn ChatPort>, sanitizer: PromptSanitizer, max_clear_attempts: u32) -> Self {
        Self {
            chat,
            sanitizer,
            max_clear_attempts,
        }
    }

    /// Run the detect -> dismiss -> verify loop for one step.
    ///
    /// Returns the snapshot planned steps should see. Never fails: click
    /// and detector errors degrade to "no obstacle cleared".
    pub async fn clear(
        &self,
        bridge: &dyn BridgePort,
        run_id: &Id,
        sleeper: &Sleeper,
        snapshot: DomSnapshot,
        dismissed_types: &mut HashSet<String>,
        done: &mut Vec<ExecutedStep>,
    ) -> DomSnapshot {
        // The sentinel carries "fallback done this step": reset on entry.
        dismissed_types.remove(FALLBACK_SENTINEL);

        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut current = snapshot;

        for _ in 0..self.max_clear_attempts {
            let Some(obstacle) = self.detect(&current).await else {
                if !dismissed_types.contains(FALLBACK_SENTINEL) {
                    dismissed_types.insert(FALLBACK_SENTINEL.to_string());
                    if let Some(after) =
                        self.fallback_pass(bridge, run_id, sleeper, done).await
                    {
                        let changed = after.content != current.content;
                        current = after;
                        if changed {
                            continue;
                        }
                    }
                }
                break;
            };

            let obstacle_type = obstacle.obstacle_type.clone();

            // Handled in an earlier step: trust the earlier dismissal.
            if dismissed_types.contains(&obstacle_type) {
                debug!(%run_id, %obstacle_type, "obstacle type already dismissed this run");
                return current;
            }

            let attempt = attempts.entry(obstacle_type.clone()).or_insert(0);
            if *attempt >= MAX_ATTEMPTS_PER_TYPE {
                // Give up on this type; another obstacle may still be present.
                dismissed_types.insert(obstacle_type);
                continue;
            }
            if *attempt > 0 && obstacle.confidence == Confidence::Low {
                // Re-detected with low confidence after a click: false positive.
                debug!(%run_id, %obstacle_type, "treating low-confidence re-detection as false positive");
                dismissed_types.insert(obstacle_type);
                continue;
            }

            let use_js_click = *attempt > 0;
            *attempt += 1;

            sleeper.sleep_ms(PRE_CLICK_SETTLE_MS).await;

            let selector = sanitize_selector(&obstacle.dismiss_selector, &obstacle.dismiss_text);
            let click = if use_js_click {
                bridge
                    .call_tool(
                        run_id,
                        "evaluate",
                        json!({ "script": js_click_script(&selector, &obstacle.dismiss_text) }),
                    )
                    .await
            } else {
                bridge
                    .call_tool(run_id, "click", json!({ "selector": selector }))
                    .await
            };

            if let Err(error) = click {
                warn!(%run_id, obstacle_type = %obstacle.obstacle_type, %error, "obstacle dismiss click failed");
                continue;
            }

            sleeper.sleep_ms(POST_CLICK_SETTLE_MS).await;

            let before = current.clone();
            if let Ok(after) = bridge.snapshot(run_id).await {
                current = after;
            }
            info!(%run_id, obstacle_type = %obstacle.obstacle_type, %selector, "auto-dismissed obstacle");
            done.push(auto_dismiss_record(&obstacle, &selector, before, current.clone()));
            // Not marked dismissed yet; the next iteration verifies.
        }

        // Every type that was attempted counts as handled for the rest of
        // the run.
        for obstacle_type in attempts.into_keys() {
            dismissed_types.insert(obstacle_type);
        }
        current
    }

    /// Ask the detector for the most prominent obstacle, if any.
    async fn detect(&self, snapshot: &DomSnapshot) -> Option<ObstacleInfo> {
        let wrapped = self
            .sanitizer
            .wrap_untrusted(&snapshot.content, Some("page snapshot"));
        let user_prompt = format!("Page URL: {}\n\n{}", snapshot.url, wrapped.text);

        let response = match self
            .chat
            .call(
                DETECTOR_SYSTEM_PROMPT,
                &user_prompt,
                Some(OBSTACLE_DETECTION_TEMPERATURE),
            )
            .await
        {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "obstacle detector unavailable");
                return None;
            }
        };

        parse_obstacle(&response)
    }

    /// Try the fixed framework selector list. Returns the fresh snapshot
    /// when something was clicked, None otherwise.
    async fn fallback_pass(
        &self,
        bridge: &dyn BridgePort,
        run_id: &Id,
        sleeper: &Sleeper,
        done: &mut Vec<ExecutedStep>,
    ) -> Option<DomSnapshot> {
        for selector in FALLBACK_SELECTORS {
            let result = bridge
                .call_tool(
                    run_id,
                    "evaluate",
                    json!({ "script": fallback_click_script(selector) }),
                )
                .await;

            let clicked = match result {
                Ok(result) => result.value.as_str() == Some("clicked"),
                Err(_) => false,
            };
            if !clicked {
                continue;
            }

            info!(%run_id, selector, "fallback selector dismissed an obstacle");
            sleeper.sleep_ms(POST_CLICK_SETTLE_MS).await;
            let after = bridge.snapshot(run_id).await.ok()?;
            let obstacle = ObstacleInfo {
                obstacle_type: "consent_fallback".to_string(),
                description: format!("fallback selector {selector}"),
                dismiss_selector: (*selector).to_string(),
                dismiss_text: String::new(),
                confidence: Confidence::Medium,
            };
            done.push(auto_dismiss_record(
                &obstacle,
                selector,
                DomSnapshot::empty(),
                after.clone(),
            ));
            return Some(after);
        }
        None
    }
}

/// Audit-trail record for an automatic dismissal.
fn auto_dismiss_record(
    obstacle: &ObstacleInfo,
    selector: &str,
    before: DomSnapshot,
    after: DomSnapshot,
) -> ExecutedStep {
    let mut step = ActionStep::new(
        ActionKind::Click,
        format!("Auto-dismiss: {}", obstacle.obstacle_type),
    );
    step.selector = Some(selector.to_string());
    ExecutedStep {
        step,
        selector_used: Some(selector.to_string()),
        before: Some(before),
        after: Some(after),
        duration_ms: 0,
        retry_count: 0,
        disposition: StepDisposition::Success,
        reason: None,
        suggestion: None,
        console_logs: Vec::new(),
        page_errors: Vec::new(),
        metrics: None,
        executed_at: chrono::Utc::now(),
    }
}

/// Parse the detector's response, tolerating fences and a NONE answer.
fn parse_obstacle(response: &str) -> Option<ObstacleInfo> {
    let trimmed = response.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return None;
    }
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let cleaned = without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim();

    let value: serde_json::Value = serde_json::from_str(cleaned).ok()?;
    let obstacle_type = value
        .get("obstacle_type")
        .or_else(|| value.get("type"))
        .and_then(serde_json::Value::as_str)?
        .trim()
        .to_string();
    if obstacle_type.is_empty() || obstacle_type.eq_ignore_ascii_case("none") {
        return None;
    }

    let confidence = match value
        .get("confidence")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("medium")
        .to_lowercase()
        .as_str()
    {
        "high" => Confidence::High,
        "low" => Confidence::Low,
        _ => Confidence::Medium,
    };

    Some(ObstacleInfo {
        obstacle_type,
        description: value
            .get("description")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        dismiss_selector: value
            .get("dismiss_selector")
            .or_else(|| value.get("selector"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        dismiss_text: value
            .get("dismiss_text")
            .or_else(|| value.get("text"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string(),
        confidence,
    })
}
