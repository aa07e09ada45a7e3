use serde::{Deserialize, Serialize};

use crate::app::AppIdentifier;

/// The kind of long-running job the operation engine can run (spec §3).
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
  Install,
  Start,
  Stop,
  Recreate,
  Delete,
  UpdateImage,
  Expose,
  Unexpose,
  ModelInstall,
  Health,
  ModelHealth,
}

impl std::fmt::Display for OperationKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Install => "install",
      Self::Start => "start",
      Self::Stop => "stop",
      Self::Recreate => "recreate",
      Self::Delete => "delete",
      Self::UpdateImage => "update_image",
      Self::Expose => "expose",
      Self::Unexpose => "unexpose",
      Self::ModelInstall => "model_install",
      Self::Health => "health",
      Self::ModelHealth => "model_health",
    };
    f.write_str(s)
  }
}

/// Operation lifecycle state (spec §3, §4.F). No transitions back;
/// `Completed`/`Failed`/`Cancelled` are terminal.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
  Pending,
  InProgress,
  Completed,
  Failed,
  Cancelled,
}

impl OperationState {
  pub const fn is_terminal(self) -> bool {
    matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
  }
}

/// A persisted, cancellable, progress-emitting background job tied to an
/// app or model (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
  pub id: String,
  pub app_id: AppIdentifier,
  pub kind: OperationKind,
  pub state: OperationState,
  pub started_at: chrono::DateTime<chrono::Utc>,
  pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
  pub error: Option<String>,
  pub last_event_seq: u64,
}

impl Operation {
  pub fn new(id: String, app_id: AppIdentifier, kind: OperationKind) -> Self {
    Self {
      id,
      app_id,
      kind,
      state: OperationState::Pending,
      started_at: chrono::Utc::now(),
      finished_at: None,
      error: None,
      last_event_seq: 0,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn terminal_states() {
    assert!(OperationState::Completed.is_terminal());
    assert!(OperationState::Failed.is_terminal());
    assert!(OperationState::Cancelled.is_terminal());
    assert!(!OperationState::Pending.is_terminal());
    assert!(!OperationState::InProgress.is_terminal());
  }
}
