use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One structured message in an operation's output stream (spec §3).
///
/// Invariant enforced by the operation engine, not by this type: every
/// channel produces zero-or-more non-terminal events then exactly one
/// terminal event (`Success` or `Error`), then closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
  #[serde(rename = "type")]
  pub kind: ProgressEventKind,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub percent: Option<u8>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
  /// Engine-internal: whether this event ends the operation's channel.
  /// Not part of the wire contract — a `kind: error` line parsed out of
  /// a runtime's stderr (e.g. a fatal keyword match) is not necessarily
  /// the operation's actual outcome, which is decided by the child
  /// process's exit code (spec §4.E rule 1). Deliberately decoupled
  /// from `kind` so the two can't be conflated.
  #[serde(skip)]
  pub terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
  Log,
  Progress,
  Error,
  Success,
}

impl ProgressEvent {
  pub fn log(message: impl Into<String>) -> Self {
    Self { kind: ProgressEventKind::Log, message: message.into(), code: None, percent: None, data: None, terminal: false }
  }

  pub fn progress(message: impl Into<String>, percent: u8) -> Self {
    Self {
      kind: ProgressEventKind::Progress,
      message: message.into(),
      code: None,
      percent: Some(percent.min(100)),
      data: None,
      terminal: false,
    }
  }

  pub fn progress_with_data(message: impl Into<String>, percent: u8, data: Value) -> Self {
    Self {
      kind: ProgressEventKind::Progress,
      message: message.into(),
      code: None,
      percent: Some(percent.min(100)),
      data: Some(data),
      terminal: false,
    }
  }

  pub fn success(message: impl Into<String>) -> Self {
    Self { kind: ProgressEventKind::Success, message: message.into(), code: None, percent: None, data: None, terminal: true }
  }

  /// The operation's actual terminal failure (spec §4.E rule 1). Not to
  /// be confused with [`ProgressEvent::fatal_log`], which looks like an
  /// error but isn't terminal by itself.
  pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
    Self {
      kind: ProgressEventKind::Error,
      message: message.into(),
      code: Some(code.into()),
      percent: None,
      data: None,
      terminal: true,
    }
  }

  /// An `error`-shaped line parsed out of a runtime's stdout/stderr
  /// (spec §4.E rule 1) — reported with `kind: error` so consumers see
  /// it styled as an error, but never terminal: the operation's real
  /// outcome is decided by the child process's exit code, not by one
  /// line of its output looking fatal.
  pub fn fatal_log(message: impl Into<String>) -> Self {
    Self { kind: ProgressEventKind::Error, message: message.into(), code: None, percent: None, data: None, terminal: false }
  }

  pub fn is_terminal(&self) -> bool {
    self.terminal
  }

  /// A synthetic marker for dropped `log` events on subscriber buffer
  /// overflow (spec §4.F, §5). Never used for terminal events.
  pub fn dropped_events(count: u64) -> Self {
    Self {
      kind: ProgressEventKind::Log,
      message: format!("{count} log event(s) dropped due to slow consumer"),
      code: None,
      percent: None,
      data: Some(serde_json::json!({ "dropped_events": count })),
      terminal: false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn success_and_error_are_terminal() {
    assert!(ProgressEvent::success("done").is_terminal());
    assert!(ProgressEvent::error("boom", "compose_error").is_terminal());
    assert!(!ProgressEvent::log("hi").is_terminal());
    assert!(!ProgressEvent::progress("pulling", 50).is_terminal());
  }

  #[test]
  fn fatal_log_looks_like_error_but_is_not_terminal() {
    let e = ProgressEvent::fatal_log("Error: failed to create network");
    assert_eq!(e.kind, ProgressEventKind::Error);
    assert!(!e.is_terminal());
  }

  #[test]
  fn percent_is_clamped() {
    let e = ProgressEvent::progress("x", 250);
    assert_eq!(e.percent, Some(100));
  }

  #[test]
  fn serializes_to_expected_jsonl_shape() {
    let e = ProgressEvent::error("compose up failed", "compose_error");
    let v: serde_json::Value = serde_json::to_value(&e).unwrap();
    assert_eq!(v["type"], "error");
    assert_eq!(v["code"], "compose_error");
    assert!(v.get("percent").is_none());
  }
}
