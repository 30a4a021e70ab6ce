//! Plan generation.
//!
//! Turns (target URL, goals, persona) into raw action steps through the
//! chat port. The planner owns prompt assembly and response parsing only;
//! sanitization and domain verification happen downstream.

use crate::ai::{ChatError, ChatPort};
use crate::safety::PlanSanitizer;
use pilot_core::{ActionKind, ActionStep};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("chat error: {0}")]
    Chat(#[from] ChatError),
    #[error("planner input exceeds the prompt budget")]
    PromptTooLarge,
    #[error("planner returned malformed steps: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, PlanError>;

const PLANNER_SYSTEM_PROMPT: &str = "You are a test planner for a browser automation runner. \
     Produce a JSON array of atomic steps that accomplish the user's goals \
     on the target site. Each step is an object with fields: \
     \"action\" (one of navigate, click, type, hover, wait, screenshot, \
     scroll, measure_performance), \"target\" (natural-language element \
     description, may be empty), optional \"selector\", optional \"value\" \
     (url for navigate, text for type, milliseconds for wait), optional \
     \"params\" (string map). Respond with the JSON array only.";

#[derive(Debug, Deserialize)]
struct RawStep {
    action: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    params: std::collections::BTreeMap<String, String>,
}

/// AI-backed planner.
pub struct Planner {
    chat: Arc<dyn ChatPort>,
    sanitizer: PlanSanitizer,
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner").finish_non_exhaustive()
    }
}

impl Planner {
    pub fn new(chat: Arc<dyn ChatPort>, sanitizer: PlanSanitizer) -> Self {
        Self { chat, sanitizer }
    }

    /// Ask for a raw plan. The result has not been sanitized or
    /// domain-checked yet.
    pub async fn plan(
        &self,
        target_url: &str,
        goals: &[String],
        persona: &str,
    ) -> Result<Vec<ActionStep>> {
        if !self.sanitizer.validate_prompt_size(PLANNER_SYSTEM_PROMPT, goals) {
            return Err(PlanError::PromptTooLarge);
        }

        let goal_list = goals
            .iter()
            .enumerate()
            .map(|(i, goal)| format!("{}. {goal}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let user_prompt = format!(
            "Target URL: {target_url}\nPersona: {persona}\nGoals:\n{goal_list}"
        );

        let response = self.chat.call(PLANNER_SYSTEM_PROMPT, &user_prompt, None).await?;
        let steps = parse_plan(&response)?;
        debug!(step_count = steps.len(), "planner produced raw steps");
        Ok(steps)
    }
}

/// Parse a JSON plan out of a chat response, tolerating markdown fences.
pub fn parse_plan(response: &str) -> Result<Vec<ActionStep>> {
    let trimmed = strip_fences(response);
    let raw: Vec<RawStep> = serde_json::from_str(trimmed)
        .map_err(|e| PlanError::Malformed(format!("{e}: {trimmed}")))?;

    let mut steps = Vec::with_capacity(raw.len());
    for item in raw {
        let Some(action) = parse_action(&item.action) else {
            return Err(PlanError::Malformed(format!(
                "unknown action: {}",
                item.action
            )));
        };
        let mut step = ActionStep::new(action, item.target);
        step.selector = item.selector.filter(|s| !s.trim().is_empty());
        step.value = item.value;
        step.params = item.params;
        steps.push(step);
    }
    Ok(steps)
}

fn parse_action(name: &str) -> Option<ActionKind> {
    match name.trim().to_lowercase().as_str() {
        "navigate" => Some(ActionKind::Navigate),
        "click" => Some(ActionKind::Click),
        "type" => Some(ActionKind::Type),
        "hover" => Some(ActionKind::Hover),
        "wait" => Some(ActionKind::Wait),
        "screenshot" => Some(ActionKind::Screenshot),
        "scroll" => Some(ActionKind::Scroll),
        "measure_performance" => Some(ActionKind::MeasurePerformance),
        _ => None,
    }
}

fn strip_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai;
    use async_trait::async_trait;
    use pilot_core::Config;

    struct FixedChat(String);

    #[async_trait]
    impl ChatPort for FixedChat {
        async fn call(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _temperature: Option<f32>,
        ) -> ai::Result<String> {
            Ok(self.0.clone())
        }
    }

    fn planner(response: &str) -> Planner {
        Planner::new(
            Arc::new(FixedChat(response.to_string())),
            PlanSanitizer::from_config(&Config::default()),
        )
    }

    #[tokio::test]
    async fn plan_parses_step_array() {
        let response = r#"[
            {"action": "navigate", "target": "", "value": "https://example.com"},
            {"action": "click", "target": "Login button"}
        ]"#;
        let steps = planner(response)
            .plan("https://example.com", &["Click Login".to_string()], "standard")
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].action, ActionKind::Navigate);
        assert_eq!(steps[0].value.as_deref(), Some("https://example.com"));
        assert_eq!(steps[1].target, "Login button");
    }

    #[tokio::test]
    async fn plan_tolerates_markdown_fences() {
        let response = "```json\n[{\"action\": \"click\", \"target\": \"Buy\"}]\n```";
        let steps = planner(response)
            .plan("https://example.com", &[], "standard")
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].action, ActionKind::Click);
    }

    #[tokio::test]
    async fn plan_rejects_unknown_action() {
        let response = r#"[{"action": "teleport", "target": "x"}]"#;
        let result = planner(response)
            .plan("https://example.com", &[], "standard")
            .await;
        assert!(matches!(result, Err(PlanError::Malformed(_))));
    }

    #[tokio::test]
    async fn plan_rejects_oversized_input() {
        let goals = vec!["g".repeat(20_000)];
        let result = planner("[]")
            .plan("https://example.com", &goals, "standard")
            .await;
        assert!(matches!(result, Err(PlanError::PromptTooLarge)));
    }

    #[test]
    fn parse_plan_ignores_blank_selectors() {
        let steps =
            parse_plan(r#"[{"action": "click", "target": "x", "selector": "  "}]"#).unwrap();
        assert!(steps[0].selector.is_none());
    }
}
