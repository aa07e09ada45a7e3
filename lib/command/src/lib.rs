//! One-shot command execution, for the short actions in the engine that
//! don't need a progress stream: registry-style probes, `docker compose
//! ls`, `ollama list`. Long-running, cancellable, streamed invocations
//! (compose `up`, health loops) are handled directly in
//! `bin/ontree/src/runtime.rs`, which needs a live child handle to kill.

use std::path::Path;

use run_command::{CommandOutput, async_run_command};
use serde::{Deserialize, Serialize};

/// A single executed command and its outcome, kept for operation history
/// and for surfacing actionable errors up the stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLog {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: chrono::DateTime<chrono::Utc>,
  pub end_ts: chrono::DateTime<chrono::Utc>,
}

pub async fn run_ontree_command(
  stage: &str,
  cwd: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> CommandLog {
  let command = if let Some(cwd) = cwd.into() {
    format!("cd {} && {}", cwd.display(), command.as_ref())
  } else {
    command.as_ref().to_string()
  };
  let start_ts = chrono::Utc::now();
  let output = async_run_command(&command).await;
  output_into_log(stage, command, start_ts, output)
}

/// Runs the command and redacts any of `secrets` from the captured
/// command line and output, so operation history and logs never retain
/// plaintext credentials.
pub async fn run_ontree_command_sanitized(
  stage: &str,
  cwd: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
  secrets: &[String],
) -> CommandLog {
  let mut log = run_ontree_command(stage, cwd, command).await;
  for secret in secrets {
    if secret.is_empty() {
      continue;
    }
    log.command = log.command.replace(secret.as_str(), "***");
    log.stdout = log.stdout.replace(secret.as_str(), "***");
    log.stderr = log.stderr.replace(secret.as_str(), "***");
  }
  log
}

pub fn output_into_log(
  stage: &str,
  command: String,
  start_ts: chrono::DateTime<chrono::Utc>,
  output: CommandOutput,
) -> CommandLog {
  CommandLog {
    stage: stage.to_string(),
    success: output.success(),
    stdout: output.stdout,
    stderr: output.stderr,
    command,
    start_ts,
    end_ts: chrono::Utc::now(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn runs_a_simple_command() {
    let log = run_ontree_command("Echo", None, "echo hello").await;
    assert!(log.success);
    assert!(log.stdout.contains("hello"));
  }

  #[tokio::test]
  async fn sanitizes_secrets_from_output() {
    let log = run_ontree_command_sanitized(
      "Echo Secret",
      None,
      "echo sk-mysecret123",
      &["sk-mysecret123".to_string()],
    )
    .await;
    assert!(!log.stdout.contains("sk-mysecret123"));
    assert!(log.stdout.contains("***"));
  }
}
