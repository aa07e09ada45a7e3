//! Inventory scanner (spec §4.I): enumerates apps by scanning the apps
//! directory and joins with live container state. Read-only and
//! best-effort: a runtime outage still yields the filesystem view.

use ontree_entities::{AppIdentifier, OnTreeMetadata};
use serde::Serialize;

use crate::compose::ComposeDocument;
use crate::naming::container_belongs_to_app;
use crate::runtime::{PsEntry, RuntimeAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
  NotCreated,
  Running,
  Exited,
  Partial,
  Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppSummary {
  pub id: AppIdentifier,
  pub dirname: String,
  pub services: Vec<String>,
  pub metadata: OnTreeMetadata,
  pub status: AppStatus,
  pub container_count: usize,
}

/// Lists entries under `apps_dir`, excluding dot-entries and
/// non-directories, keeping only those with a readable
/// `docker-compose.yml` (spec §4.I step 1-2).
pub async fn scan_app_dirs(apps_dir: &std::path::Path) -> Vec<String> {
  let mut out = Vec::new();
  let Ok(mut entries) = tokio::fs::read_dir(apps_dir).await else {
    return out;
  };
  while let Ok(Some(entry)) = entries.next_entry().await {
    let Ok(file_type) = entry.file_type().await else { continue };
    if !file_type.is_dir() {
      continue;
    }
    let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
    if name.starts_with('.') {
      continue;
    }
    if entry.path().join("docker-compose.yml").exists() {
      out.push(name);
    }
  }
  out
}

/// Queries `runtime.ps --all` once and joins it against the disk
/// inventory (spec §4.I step 3-4). `ps` failure degrades every app's
/// status to `unknown` rather than failing the whole scan.
pub async fn list_apps(apps_dir: &std::path::Path, adapter: &RuntimeAdapter) -> Vec<AppSummary> {
  let dirnames = scan_app_dirs(apps_dir).await;
  let ps_result = adapter.ps(apps_dir).await;

  let mut summaries = Vec::with_capacity(dirnames.len());
  for dirname in dirnames {
    let id = AppIdentifier::derive(&dirname);
    let compose_path = apps_dir.join(&dirname).join("docker-compose.yml");
    let Ok(doc) = ComposeDocument::read(&compose_path) else {
      continue;
    };
    let services = doc.services();
    let metadata = doc.get_metadata().unwrap_or_default();

    let status = match &ps_result {
      Err(_) => AppStatus::Unknown,
      Ok(entries) => {
        let matching = matching_entries(&id, entries);
        derive_status(&matching)
      }
    };
    let container_count = ps_result.as_ref().map(|entries| matching_entries(&id, entries).len()).unwrap_or(0);

    summaries.push(AppSummary { id, dirname, services, metadata, status, container_count });
  }
  summaries
}

/// Joins on the container's compose project label when present
/// (preferred — spec §4.A/§4.I), falling back to name-prefix matching
/// otherwise.
fn matching_entries<'a>(id: &AppIdentifier, entries: &'a [PsEntry]) -> Vec<&'a PsEntry> {
  entries.iter().filter(|e| container_belongs_to_app(id, &e.name, e.project.as_deref())).collect()
}

fn derive_status(entries: &[&PsEntry]) -> AppStatus {
  if entries.is_empty() {
    return AppStatus::NotCreated;
  }
  let running = entries.iter().filter(|e| e.state == "running").count();
  let exited = entries.iter().filter(|e| e.state == "exited" || e.state == "stopped").count();
  if running == entries.len() {
    AppStatus::Running
  } else if exited == entries.len() {
    AppStatus::Exited
  } else if running > 0 {
    AppStatus::Partial
  } else {
    AppStatus::Unknown
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(name: &str, state: &str) -> PsEntry {
    PsEntry { name: name.to_string(), service: "web".to_string(), state: state.to_string(), health: None, project: None }
  }

  #[test]
  fn no_containers_is_not_created() {
    assert_eq!(derive_status(&[]), AppStatus::NotCreated);
  }

  #[test]
  fn all_running_is_running() {
    let a = entry("a", "running");
    let b = entry("b", "running");
    assert_eq!(derive_status(&[&a, &b]), AppStatus::Running);
  }

  #[test]
  fn all_exited_is_exited() {
    let a = entry("a", "exited");
    assert_eq!(derive_status(&[&a]), AppStatus::Exited);
  }

  #[test]
  fn mixed_states_is_partial() {
    let a = entry("a", "running");
    let b = entry("b", "exited");
    assert_eq!(derive_status(&[&a, &b]), AppStatus::Partial);
  }

  #[test]
  fn matching_entries_joins_on_project_label_when_name_prefix_would_miss() {
    let id = AppIdentifier::derive("myapp");
    let renamed = PsEntry {
      name: "some-operator-renamed-container".to_string(),
      service: "web".to_string(),
      state: "running".to_string(),
      health: None,
      project: Some(crate::naming::compose_project_name(&id)),
    };
    let matched = matching_entries(&id, std::slice::from_ref(&renamed));
    assert_eq!(matched.len(), 1);
  }

  #[tokio::test]
  async fn scan_skips_dot_entries_and_dirs_without_compose() {
    let root = tempfile::tempdir().unwrap();
    tokio::fs::create_dir_all(root.path().join(".hidden")).await.unwrap();
    tokio::fs::create_dir_all(root.path().join("no-compose")).await.unwrap();
    let with_compose = root.path().join("myapp");
    tokio::fs::create_dir_all(&with_compose).await.unwrap();
    tokio::fs::write(with_compose.join("docker-compose.yml"), "services: {}\n").await.unwrap();

    let mut found = scan_app_dirs(root.path()).await;
    found.sort();
    assert_eq!(found, vec!["myapp".to_string()]);
  }
}
