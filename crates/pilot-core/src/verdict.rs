//! Reflection verdicts.
//!
//! The reflector maps every raw step outcome into exactly one of these
//! five dispositions; the step loop dispatches on the variant.

use crate::types::ActionStep;
use serde::{Deserialize, Serialize};

/// Decision produced by reflecting on a step outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ReflectionResult {
    /// The step achieved its intent; `selector` is the locator that worked.
    Success { selector: Option<String> },
    /// Re-queue the repair steps at the tail and try again.
    Retry {
        reason: String,
        repair_steps: Vec<ActionStep>,
    },
    /// Sleep, then re-queue the original step.
    Wait { reason: String, ms: u64 },
    /// Give up on the whole run.
    Abort { reason: String },
    /// Drop this step and continue with the rest of the plan.
    Skip { reason: String },
}

impl ReflectionResult {
    pub fn success(selector: Option<String>) -> Self {
        Self::Success { selector }
    }

    pub fn retry(reason: impl Into<String>, repair_steps: Vec<ActionStep>) -> Self {
        Self::Retry {
            reason: reason.into(),
            repair_steps,
        }
    }

    pub fn wait(reason: impl Into<String>, ms: u64) -> Self {
        Self::Wait {
            reason: reason.into(),
            ms,
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            reason: reason.into(),
        }
    }

    /// Verdict name for logging and audit payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Retry { .. } => "retry",
            Self::Wait { .. } => "wait",
            Self::Abort { .. } => "abort",
            Self::Skip { .. } => "skip",
        }
    }
}
