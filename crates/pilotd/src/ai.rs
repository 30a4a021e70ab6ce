//! Chat backend port.
//!
//! The orchestrator's single capability against the AI backend: one
//! prompt-in, text-out call. Planner, reflector helpers, obstacle detector
//! and the suggestion pass all go through this trait; providers live
//! outside the core.

use async_trait::async_trait;
use thiserror::Error;

/// Temperature for obstacle detection (near-deterministic).
pub const OBSTACLE_DETECTION_TEMPERATURE: f32 = 0.1;
/// Temperature for optimization suggestions.
pub const SUGGESTION_TEMPERATURE: f32 = 0.3;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat backend unavailable: {0}")]
    Unavailable(String),
    #[error("chat call timed out")]
    Timeout,
    #[error("chat backend returned an error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;

/// One-shot chat capability. `temperature` of `None` uses the provider
/// default. No streaming.
#[async_trait]
pub trait ChatPort: Send + Sync {
    async fn call(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: Option<f32>,
    ) -> Result<String>;
}

/// Chat provider that shells out to an external CLI, writing the prompt to
/// stdin and reading the completion from stdout.
#[derive(Debug, Clone)]
pub struct CommandChat {
    program: String,
    args: Vec<String>,
    timeout: std::time::Duration,
}

impl CommandChat {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: std::time::Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl ChatPort for CommandChat {
    async fn call(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: Option<f32>,
    ) -> Result<String> {
        use tokio::io::AsyncWriteExt;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--system")
            .arg(system_prompt)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        if let Some(temperature) = temperature {
            command.arg("--temperature").arg(temperature.to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|e| ChatError::Unavailable(format!("{}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(user_prompt.as_bytes())
                .await
                .map_err(|e| ChatError::Backend(e.to_string()))?;
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ChatError::Timeout)?
            .map_err(|e| ChatError::Backend(e.to_string()))?;

        if !output.status.success() {
            return Err(ChatError::Backend(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
