use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A lowercased, hyphen/digit/letter identifier derived from an app's
/// directory name (spec §3, §4.A). The only form used in project names,
/// container names, network/volume names and proxy route ids.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AppIdentifier(String);

impl AppIdentifier {
  /// `id(N) = lowercase(N)` with non-`[a-z0-9-]` characters replaced by
  /// `-`, consecutive separator runs collapsed. Deterministic and total:
  /// any non-empty input has a representable id.
  pub fn derive(dirname: &str) -> Self {
    let lowered = dirname.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_dash = false;
    for ch in lowered.chars() {
      if ch.is_ascii_alphanumeric() {
        out.push(ch);
        last_was_dash = false;
      } else if !last_was_dash {
        out.push('-');
        last_was_dash = true;
      }
    }
    let trimmed = out.trim_matches('-');
    Self(trimmed.to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for AppIdentifier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl AsRef<str> for AppIdentifier {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

/// The `x-ontree` extension embedded in the compose document (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnTreeMetadata {
  #[serde(default)]
  pub subdomain: String,
  #[serde(default)]
  pub host_port: u32,
  #[serde(default)]
  pub is_exposed: bool,
  #[serde(default)]
  pub emoji: String,
  /// Administrator-only escape hatch. Never writable through the normal
  /// app APIs (spec §4.C, §9 open question — resolved in DESIGN.md).
  #[serde(default)]
  pub bypass_security: bool,
}

impl Default for OnTreeMetadata {
  fn default() -> Self {
    Self {
      subdomain: String::new(),
      host_port: 0,
      is_exposed: false,
      emoji: String::new(),
      bypass_security: false,
    }
  }
}

/// `app.yml`: agent-facing metadata about the app's expected shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetadata {
  pub id: String,
  pub primary_service: String,
  #[serde(default)]
  pub expected_services: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub initial_setup_required: Option<bool>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub uptime_kuma_monitor: Option<String>,
}

/// The on-disk paths owned by a single app (spec §4.A).
#[derive(Debug, Clone)]
pub struct AppPaths {
  pub app_dir: PathBuf,
  pub compose_path: PathBuf,
  pub env_path: PathBuf,
  pub app_yaml_path: PathBuf,
  pub volumes_root: PathBuf,
  pub mnt_root: PathBuf,
}

impl AppPaths {
  pub fn new(apps_root: &Path, dirname: &str) -> Self {
    let app_dir = apps_root.join(dirname);
    Self {
      compose_path: app_dir.join("docker-compose.yml"),
      env_path: app_dir.join(".env"),
      app_yaml_path: app_dir.join("app.yml"),
      volumes_root: app_dir.join("volumes"),
      mnt_root: app_dir.join("mnt"),
      app_dir,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn derive_lowercases_and_replaces() {
    assert_eq!(AppIdentifier::derive("OpenWebUI-0902").as_str(), "openwebui-0902");
    assert_eq!(AppIdentifier::derive("My App!!").as_str(), "my-app");
    assert_eq!(AppIdentifier::derive("--leading").as_str(), "leading");
  }

  #[test]
  fn derive_is_deterministic() {
    assert_eq!(AppIdentifier::derive("Foo_Bar"), AppIdentifier::derive("Foo_Bar"));
  }

  #[test]
  fn distinct_inputs_yield_distinct_ids_in_common_case() {
    assert_ne!(AppIdentifier::derive("foo"), AppIdentifier::derive("bar"));
  }
}
