//! Naming & paths (spec §4.A): canonical identifiers derived from an
//! app's directory name, and the disk layout contract (spec §6).

use std::path::{Path, PathBuf};

pub use ontree_entities::app::{AppIdentifier, AppPaths};

/// `composeProjectName(id) -> "ontree-<id>"` (spec §4.A).
pub fn compose_project_name(id: &AppIdentifier) -> String {
  format!("ontree-{id}")
}

/// `containerPrefix(id) -> "ontree-<id>-"`.
pub fn container_prefix(id: &AppIdentifier) -> String {
  format!("ontree-{id}-")
}

/// A container belongs to app `id` iff either its compose project label
/// equals `composeProjectName(id)`, or its name (leading `/` stripped)
/// starts with `containerPrefix(id)` case-insensitively (spec §4.A, §8
/// scenario 2).
pub fn container_belongs_to_app(
  id: &AppIdentifier,
  container_name: &str,
  project_label: Option<&str>,
) -> bool {
  if let Some(label) = project_label
    && label == compose_project_name(id)
  {
    return true;
  }
  let stripped = container_name.strip_prefix('/').unwrap_or(container_name);
  stripped.to_lowercase().starts_with(&container_prefix(id).to_lowercase())
}

/// Root for the shared inference container's model directory, outside
/// any per-app directory (spec §4.A).
pub fn shared_ollama_root(shared_root: &Path) -> PathBuf {
  shared_root.join("ollama")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn project_name_format() {
    assert_eq!(
      compose_project_name(&AppIdentifier::derive("myapp")),
      "ontree-myapp"
    );
  }

  #[test]
  fn container_naming_scenario() {
    // spec §8 scenario 2
    let id = AppIdentifier::derive("OpenWebUI-0902");
    assert_eq!(id.as_str(), "openwebui-0902");
    assert!(container_belongs_to_app(
      &id,
      "/ontree-openwebui-0902-openwebui-1",
      None
    ));
    assert!(!container_belongs_to_app(
      &id,
      "/openwebui-0902-openwebui-1",
      None
    ));
  }

  #[test]
  fn container_naming_via_project_label() {
    let id = AppIdentifier::derive("myapp");
    assert!(container_belongs_to_app(
      &id,
      "/anything-at-all-1",
      Some("ontree-myapp")
    ));
  }

  #[test]
  fn prefix_match_is_case_insensitive() {
    let id = AppIdentifier::derive("myapp");
    assert!(container_belongs_to_app(&id, "/ONTREE-MYAPP-web-1", None));
  }
}
