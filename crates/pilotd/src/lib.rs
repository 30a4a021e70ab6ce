//! pilotd - AI-guided browser test orchestration daemon
//!
//! Library components for the daemon process: run execution, the step
//! loop and reflector, obstacle clearing, the safety pipeline, admission
//! and rate-limit controllers, and the browser bridge client.

pub mod admission;
pub mod ai;
pub mod audit;
pub mod bridge;
pub mod executor;
pub mod obstacles;
pub mod planner;
pub mod ratelimit;
pub mod reflector;
pub mod resolver;
pub mod safety;
pub mod sleeper;
pub mod steps;
pub mod store;

use crate::ai::ChatPort;
use crate::bridge::BridgePort;
use crate::executor::RunExecutor;
use crate::obstacles::ObstacleClearer;
use crate::planner::Planner;
use crate::reflector::Reflector;
use crate::resolver::SelectorResolver;
use crate::safety::{PlanSanitizer, TargetGuard};
use crate::steps::StepLoop;
use crate::store::{CompletionSink, EventSink, RunStore, ScreenshotStore};
use pilot_core::prompt::PromptSanitizer;
use pilot_core::Config;
use std::sync::Arc;

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// External collaborators the executor is wired against.
pub struct ExecutorDeps {
    pub bridge: Arc<dyn BridgePort>,
    pub chat: Arc<dyn ChatPort>,
    pub run_store: Arc<dyn RunStore>,
    pub screenshot_store: Arc<dyn ScreenshotStore>,
    pub completion_sink: Arc<dyn CompletionSink>,
    pub events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ExecutorDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorDeps").finish_non_exhaustive()
    }
}

/// Wire up a [`RunExecutor`] from configuration and collaborators.
pub fn build_executor(config: &Config, deps: ExecutorDeps) -> RunExecutor {
    let prompt_sanitizer = PromptSanitizer::new(config.prompt_max_content_length);
    let plan_sanitizer = PlanSanitizer::from_config(config);

    let planner = Planner::new(Arc::clone(&deps.chat), plan_sanitizer.clone());
    let resolver = Arc::new(SelectorResolver::new(
        Arc::clone(&deps.chat),
        prompt_sanitizer.clone(),
    ));
    let clearer = ObstacleClearer::new(
        Arc::clone(&deps.chat),
        prompt_sanitizer,
        config.max_obstacle_clear_attempts,
    );
    let reflector = Reflector::new(config.max_retries);
    let step_loop = StepLoop::new(
        Arc::clone(&deps.bridge),
        Arc::clone(&deps.chat),
        resolver,
        clearer,
        reflector,
        Arc::clone(&deps.run_store),
        deps.screenshot_store,
        Arc::clone(&deps.events),
        config.clone(),
    );

    RunExecutor::new(
        deps.bridge,
        planner,
        step_loop,
        TargetGuard::from_config(config),
        plan_sanitizer,
        deps.run_store,
        deps.completion_sink,
        deps.events,
        config.clone(),
    )
}
