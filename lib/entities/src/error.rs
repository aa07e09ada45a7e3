use thiserror::Error;

/// Stable, machine-readable error codes surfaced on terminal
/// [`crate::progress::ProgressEvent`]s and in JSONL output (spec §7).
///
/// These are never reused for two different failure shapes: a consumer
/// matching on `code()` must be able to rely on it forever.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
  #[error("invalid app id: {0}")]
  InvalidAppId(String),
  #[error("unknown model: {0}")]
  InvalidModel(String),
  #[error("invalid subdomain: {0}")]
  SubdomainInvalid(String),
  #[error("app not found: {0}")]
  AppNotFound(String),
  #[error("failed to read template: {0}")]
  TemplateReadFailed(String),
  #[error("failed to read env file: {0}")]
  EnvReadFailed(String),
  #[error("failed to parse compose file: {0}")]
  ComposeParseFailed(String),
  #[error("compose file missing: {0}")]
  ComposeMissing(String),

  #[error("security violation in service {service}: {rule}")]
  SecurityViolation { service: String, rule: String, detail: String },

  #[error("compose command failed: {0}")]
  ComposeError(String),
  #[error("container runtime unavailable: {0}")]
  ComposeUnavailable(String),
  #[error("exec failed: {0}")]
  ExecFailed(String),
  #[error("no inference container is running")]
  OllamaNotRunning,

  #[error("health check timed out")]
  HealthTimeout,
  #[error("health check failed: {0}")]
  HealthCheckFailed(String),

  #[error("reverse proxy is unavailable: {0}")]
  ProxyUnavailable(String),
  #[error("reverse proxy returned an error: {0}")]
  ProxyError(String),
  #[error("no domains are configured")]
  NoDomainsConfigured,

  #[error("another operation is already in progress for this app")]
  OperationInProgress,
  #[error("operation was orphaned by a process restart")]
  Orphaned,
  #[error("operation was cancelled")]
  ContextCancelled,
  #[error("setup has already been completed")]
  SetupAlreadyCompleted,
}

impl EngineError {
  /// The stable identifier for this error, as it appears in the `code`
  /// field of a terminal `ProgressEvent` and as the CLI's diagnostic code.
  pub fn code(&self) -> &'static str {
    match self {
      Self::InvalidAppId(_) => "invalid_app_id",
      Self::InvalidModel(_) => "invalid_model",
      Self::SubdomainInvalid(_) => "subdomain_invalid",
      Self::AppNotFound(_) => "app_not_found",
      Self::TemplateReadFailed(_) => "template_read_failed",
      Self::EnvReadFailed(_) => "env_read_failed",
      Self::ComposeParseFailed(_) => "compose_parse_failed",
      Self::ComposeMissing(_) => "compose_missing",
      Self::SecurityViolation { .. } => "security_violation",
      Self::ComposeError(_) => "compose_error",
      Self::ComposeUnavailable(_) => "compose_unavailable",
      Self::ExecFailed(_) => "exec_failed",
      Self::OllamaNotRunning => "ollama_not_running",
      Self::HealthTimeout => "health_timeout",
      Self::HealthCheckFailed(_) => "health_check_failed",
      Self::ProxyUnavailable(_) => "proxy_unavailable",
      Self::ProxyError(_) => "proxy_error",
      Self::NoDomainsConfigured => "no_domains_configured",
      Self::OperationInProgress => "operation_in_progress",
      Self::Orphaned => "orphaned",
      Self::ContextCancelled => "context_cancelled",
      Self::SetupAlreadyCompleted => "setup_already_completed",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn codes_are_stable_identifiers() {
    assert_eq!(EngineError::OllamaNotRunning.code(), "ollama_not_running");
    assert_eq!(
      EngineError::SecurityViolation {
        service: "web".into(),
        rule: "privileged mode".into(),
        detail: "".into(),
      }
      .code(),
      "security_violation"
    );
  }
}
