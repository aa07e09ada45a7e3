//! Progress parser (spec §4.E): turns a runtime's stdout/stderr line
//! stream into structured [`ProgressEvent`]s.

use std::collections::HashMap;
use std::sync::LazyLock;

use ontree_entities::{ProgressEvent, ProgressEventKind};
use regex::Regex;

static LAYER_DOWNLOAD: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(?P<id>\S+)\s+Downloading\s+\[.*?\]\s+(?P<cur>[\d.]+)\s*(?P<cur_unit>[KMGT]?B)\s*/\s*(?P<total>[\d.]+)\s*(?P<total_unit>[KMGT]?B)").unwrap()
});

static LAYER_PHASE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(?P<id>\S+)\s+(?P<phase>Pulling fs layer|Waiting|Verifying Checksum|Download complete|Extracting|Pull complete|Already exists)").unwrap()
});

static CONTAINER_LIFECYCLE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?i)^\s*(Container|Network|Volume)\s+(?P<name>\S+)\s+(?P<action>Creating|Created|Starting|Started|Stopping|Stopped|Removing|Removed)").unwrap()
});

static FATAL_KEYWORDS: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?i)^\s*(error|failed|cannot)\b").unwrap());

/// Tracks per-image download progress across lines so a multi-image
/// pull can report the arithmetic mean as its overall percent (spec
/// §4.E).
#[derive(Default)]
pub struct ProgressParser {
  image_percents: HashMap<String, f32>,
}

impl ProgressParser {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn parse_line(&mut self, line: &str) -> ProgressEvent {
    if let Some(caps) = LAYER_DOWNLOAD.captures(line) {
      let id = caps["id"].to_string();
      let cur = parse_size(&caps["cur"], &caps["cur_unit"]);
      let total = parse_size(&caps["total"], &caps["total_unit"]);
      let percent = if total > 0.0 { ((cur / total) * 100.0).min(100.0) } else { 0.0 };
      self.image_percents.insert(id.clone(), percent as f32);
      return ProgressEvent::progress_with_data(
        line.to_string(),
        self.overall_percent().unwrap_or(percent as u8),
        serde_json::json!({ "image": id }),
      );
    }

    if let Some(caps) = LAYER_PHASE.captures(line) {
      let id = caps["id"].to_string();
      let phase = &caps["phase"];
      let percent = match phase {
        "Pulling fs layer" | "Waiting" => 0.0,
        "Verifying Checksum" | "Download complete" => 90.0,
        "Extracting" => 95.0,
        "Pull complete" | "Already exists" => 100.0,
        _ => 0.0,
      };
      self.image_percents.insert(id.clone(), percent);
      return ProgressEvent::progress_with_data(
        line.to_string(),
        self.overall_percent().unwrap_or(percent as u8),
        serde_json::json!({ "image": id, "phase": phase }),
      );
    }

    if let Some(caps) = CONTAINER_LIFECYCLE.captures(line) {
      let percent = match &caps["action"] {
        "Creating" => 70,
        "Created" => 80,
        "Starting" => 90,
        "Started" => 95,
        _ => 99,
      };
      return ProgressEvent::progress(line.to_string(), percent);
    }

    if FATAL_KEYWORDS.is_match(line) {
      // Not terminal by itself — the operation's terminal state is
      // decided by the child process's exit code (spec §4.E rule 1).
      return ProgressEvent::fatal_log(line.to_string());
    }

    ProgressEvent::log(line.to_string())
  }

  fn overall_percent(&self) -> Option<u8> {
    if self.image_percents.is_empty() {
      return None;
    }
    let sum: f32 = self.image_percents.values().sum();
    Some((sum / self.image_percents.len() as f32) as u8)
  }
}

/// Parses sizes with KB/MB/GB/TB units, base 1024, per spec §4.E.
fn parse_size(value: &str, unit: &str) -> f64 {
  let value: f64 = value.parse().unwrap_or(0.0);
  let multiplier = match unit.to_uppercase().as_str() {
    "KB" => 1024.0,
    "MB" => 1024.0 * 1024.0,
    "GB" => 1024.0 * 1024.0 * 1024.0,
    "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
    _ => 1.0,
  };
  value * multiplier
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_layer_download_progress() {
    let mut parser = ProgressParser::new();
    let event = parser.parse_line("abc123 Downloading [====>     ]  10MB/20MB");
    assert_eq!(event.kind, ProgressEventKind::Progress);
    assert_eq!(event.percent, Some(50));
  }

  #[test]
  fn multi_image_percent_is_mean() {
    let mut parser = ProgressParser::new();
    parser.parse_line("imgA Downloading [====>     ]  50MB/100MB");
    let event = parser.parse_line("imgB Downloading [========> ]  90MB/100MB");
    assert_eq!(event.percent, Some(70));
  }

  #[test]
  fn recognises_container_lifecycle_lines() {
    let mut parser = ProgressParser::new();
    let event = parser.parse_line("Container ontree-myapp-web-1  Starting");
    assert_eq!(event.percent, Some(90));
  }

  #[test]
  fn fatal_keyword_is_error_but_not_terminal_by_itself() {
    let mut parser = ProgressParser::new();
    let event = parser.parse_line("Error: failed to create network");
    assert_eq!(event.kind, ProgressEventKind::Error);
    assert!(event.code.is_none());
    assert!(!event.is_terminal());
  }

  #[test]
  fn unrecognised_line_is_log() {
    let mut parser = ProgressParser::new();
    let event = parser.parse_line("Network ontree-myapp_default  Creating");
    assert_eq!(event.percent, Some(70));
    let event2 = parser.parse_line("some unrelated stdout noise");
    assert_eq!(event2.kind, ProgressEventKind::Log);
  }
}
