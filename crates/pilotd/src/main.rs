//! pilotd - AI-guided browser test orchestration daemon
//!
//! Main entry point for the daemon binary. Loads a declarative test from a
//! JSON file, runs admission, and executes it against the browser bridge.

use clap::Parser;
use eyre::{eyre, WrapErr};
use mimalloc::MiMalloc;
use pilot_core::{AdmissionDecision, AuditRecord, Config, Event, EventType, FailureKind, TestRun};
use pilotd::admission::ConcurrentTestLimit;
use pilotd::ai::CommandChat;
use pilotd::audit::{AuditWriter, TracingAuditSink};
use pilotd::bridge::{BridgeConfig, StdioBridge};
use pilotd::ratelimit::{RateLimitService, RateScope};
use pilotd::store::{
    EventSink, MemoryCompletionSink, MemoryRunStore, MemoryScreenshotStore, TracingEventSink,
};
use pilotd::{build_executor, AppResult, ExecutorDeps};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "pilotd")]
#[command(about = "AI-guided browser test orchestrator", long_about = None)]
struct Cli {
    /// Path to the test definition (JSON).
    #[arg(short, long)]
    file: PathBuf,

    /// Path to a key=value config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Client IP recorded for rate limiting and audit.
    #[arg(long, default_value = "127.0.0.1")]
    client_ip: String,

    /// Command used for chat completions (reads prompt on stdin).
    #[arg(long, default_value = "pilot-chat")]
    chat_cmd: String,

    /// Command used to launch the browser bridge subprocess.
    #[arg(long, default_value = "node")]
    bridge_cmd: String,

    /// Arguments for the bridge subprocess.
    #[arg(long, default_value = "bridge/server.js")]
    bridge_args: String,
}

/// On-disk test definition.
#[derive(Debug, Deserialize)]
struct TestFile {
    tenant_id: String,
    target_url: String,
    goals: Vec<String>,
    #[serde(default = "default_persona")]
    persona: String,
}

fn default_persona() -> String {
    "standard".to_string()
}

fn main() -> AppResult<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path).wrap_err("loading config file")?,
        None => Config::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: Config) -> AppResult<()> {
    let test: TestFile = serde_json::from_str(
        &std::fs::read_to_string(&cli.file).wrap_err("reading test file")?,
    )
    .wrap_err("parsing test file")?;

    let mut run = TestRun::new(test.tenant_id, test.target_url, test.goals, test.persona);

    // Process-wide controllers with their sweep tasks.
    let mut concurrent_limit = ConcurrentTestLimit::from_config(&config);
    concurrent_limit.start_sweeper();
    let mut rate_limits = RateLimitService::from_config(&config);
    rate_limits.start_sweeper();
    let audit = AuditWriter::new(Arc::new(TracingAuditSink));

    let domain = pilotd::safety::extract_host(&run.target_url).unwrap_or_default();

    // Admission: rate limits first, then concurrency slots.
    let rate_check = rate_limits
        .try_acquire(RateScope::User, &format!("user:{}", run.tenant_id))
        .and_then(|()| rate_limits.try_acquire(RateScope::Ip, &format!("ip:{}", cli.client_ip)))
        .and_then(|()| rate_limits.try_acquire(RateScope::Target, &format!("target:{domain}")));
    if let Err(exceeded) = rate_check {
        audit.record(AuditRecord::new(
            &run.tenant_id,
            &cli.client_ip,
            &run.target_url,
            &domain,
            AdmissionDecision::RateLimited,
            exceeded.to_string(),
        ));
        return Err(eyre!(FailureKind::LimitExceeded.reason(exceeded)));
    }
    if let Err(rejection) = concurrent_limit.acquire(&run.tenant_id, &run.id) {
        audit.record(AuditRecord::new(
            &run.tenant_id,
            &cli.client_ip,
            &run.target_url,
            &domain,
            AdmissionDecision::Blocked,
            rejection.to_string(),
        ));
        return Err(eyre!(FailureKind::LimitExceeded.reason(rejection)));
    }
    let admission_record = AuditRecord::new(
        &run.tenant_id,
        &cli.client_ip,
        &run.target_url,
        &domain,
        AdmissionDecision::Allowed,
        "within limits",
    );
    let events = Arc::new(TracingEventSink);
    events
        .append(Event::new(
            run.id.clone(),
            EventType::AdmissionDecision,
            &admission_record,
        ))
        .await;
    audit.record(admission_record);

    // Wire the executor.
    let bridge_config = BridgeConfig {
        program: cli.bridge_cmd.clone(),
        args: cli
            .bridge_args
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        call_timeout: config.bridge_call_timeout(),
        ..BridgeConfig::default()
    };
    let run_store = Arc::new(MemoryRunStore::new());
    let completion_sink = Arc::new(MemoryCompletionSink::new());
    let executor = build_executor(
        &config,
        ExecutorDeps {
            bridge: Arc::new(StdioBridge::new(bridge_config)),
            chat: Arc::new(CommandChat::new(
                cli.chat_cmd.clone(),
                Vec::new(),
                Duration::from_secs(120),
            )),
            run_store: Arc::clone(&run_store) as Arc<dyn pilotd::store::RunStore>,
            screenshot_store: Arc::new(MemoryScreenshotStore::new()),
            completion_sink: Arc::clone(&completion_sink)
                as Arc<dyn pilotd::store::CompletionSink>,
            events,
        },
    );

    executor.execute(&mut run).await;
    concurrent_limit.release(&run.tenant_id, &run.id);
    concurrent_limit.shutdown();
    rate_limits.shutdown();

    for event in completion_sink.events() {
        info!(
            run_id = %event.run_id,
            status = event.status.as_str(),
            steps = event.executed_step_count,
            "completion event"
        );
    }

    match run.failure_reason {
        None => Ok(()),
        Some(reason) => {
            error!(%reason, "run failed");
            std::process::exit(1);
        }
    }
}
