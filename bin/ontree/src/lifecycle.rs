//! App lifecycle manager (spec §4.G): install, start, stop, recreate,
//! delete, image update, health, expose/unexpose. Reads the Compose
//! metadata store, validates through the security validator, scaffolds
//! files under paths from `naming.rs`, and hands runtime work to the
//! operation engine.

use std::sync::Arc;
use std::time::Duration;

use ontree_entities::{AppIdentifier, AppPaths, EngineError, OperationKind, ProgressEvent};

use crate::compose::ComposeDocument;
use crate::config::OnTreeConfig;
use crate::engine::{OperationEngine, OperationHandle};
use crate::progress::ProgressParser;
use crate::proxy::ProxyReconciler;
use crate::runtime::{RuntimeAdapter, RuntimeKind};
use crate::security;

#[derive(Clone)]
pub struct Lifecycle {
  pub config: Arc<OnTreeConfig>,
  pub runtime_kind: RuntimeKind,
  pub engine: OperationEngine,
  pub proxy: ProxyReconciler,
}

impl Lifecycle {
  pub fn new(config: Arc<OnTreeConfig>, runtime_kind: RuntimeKind, engine: OperationEngine, proxy: ProxyReconciler) -> Self {
    Self { config, runtime_kind, engine, proxy }
  }

  fn paths(&self, dirname: &str) -> AppPaths {
    AppPaths::new(&self.config.apps_dir, dirname)
  }

  fn runtime(&self) -> RuntimeAdapter {
    RuntimeAdapter::new(self.runtime_kind)
  }

  /// Renders `templates_dir/<template_id>.yml`, substituting
  /// `{{app_id}}`, then scaffolds the app directory (spec §4.G
  /// `install`).
  pub async fn install(
    &self,
    dirname: String,
    template_id: String,
    extra_env: Vec<(String, String)>,
  ) -> Result<OperationHandle, EngineError> {
    let id = AppIdentifier::derive(&dirname);
    let paths = self.paths(&dirname);
    let config = self.config.clone();

    self
      .engine
      .schedule(id.clone(), OperationKind::Install, move |tx, _cancel| async move {
        let template_path = config.templates_dir.join(format!("{template_id}.yml"));
        let template = tokio::fs::read_to_string(&template_path)
          .await
          .map_err(|_| EngineError::TemplateReadFailed(template_path.display().to_string()))?;
        let rendered = template.replace("{{app_id}}", id.as_str());

        let parsed: serde_yaml_ng::Value = serde_yaml_ng::from_str(&rendered)
          .map_err(|e| EngineError::ComposeParseFailed(e.to_string()))?;
        let bypass = parsed
          .get("x-ontree")
          .and_then(|m| m.get("bypass_security"))
          .and_then(|v| v.as_bool())
          .unwrap_or(false);
        security::validate(&parsed, &paths, &config.shared_root, bypass, config.demo_mode)?;

        tx.send(ProgressEvent::log("validated compose content")).await.ok();

        tokio::fs::create_dir_all(&paths.volumes_root)
          .await
          .map_err(|e| EngineError::ComposeError(format!("mkdir volumes: {e}")))?;
        tokio::fs::create_dir_all(&paths.mnt_root)
          .await
          .map_err(|e| EngineError::ComposeError(format!("mkdir mnt: {e}")))?;
        set_permissions(&paths.volumes_root, 0o750).await;
        set_permissions(&paths.mnt_root, 0o750).await;

        let mut doc = ComposeDocument::parse(rendered)?;
        let host_port = doc.first_host_port().unwrap_or(0);
        let mut meta = doc.get_metadata().unwrap_or_default();
        meta.host_port = host_port;
        doc.set_metadata(&meta)?;
        doc.write(&paths.compose_path)?;
        set_permissions(&paths.compose_path, 0o600).await;

        write_env_file(&paths.env_path, &id, &extra_env).await?;
        set_permissions(&paths.env_path, 0o600).await;

        let expected_services = doc.services();
        let primary_service = expected_services.first().cloned().unwrap_or_default();
        let app_yaml = ontree_entities::AgentMetadata {
          id: id.to_string(),
          primary_service,
          expected_services,
          initial_setup_required: Some(true),
          uptime_kuma_monitor: None,
        };
        let app_yaml_str = serde_yaml_ng::to_string(&app_yaml)
          .map_err(|e| EngineError::ComposeError(format!("serialize app.yml: {e}")))?;
        tokio::fs::write(&paths.app_yaml_path, app_yaml_str)
          .await
          .map_err(|e| EngineError::ComposeError(format!("write app.yml: {e}")))?;

        if doc.references_shared_inference_root() {
          tokio::fs::create_dir_all(crate::naming::shared_ollama_root(&config.shared_root))
            .await
            .map_err(|e| EngineError::ComposeError(format!("mkdir shared ollama root: {e}")))?;
        }

        tx.send(ProgressEvent::log("app installed")).await.ok();
        Ok(())
      })
      .await
  }

  pub async fn start(&self, dirname: String) -> Result<OperationHandle, EngineError> {
    let id = AppIdentifier::derive(&dirname);
    let paths = self.paths(&dirname);
    let runtime_kind = self.runtime_kind;
    self
      .engine
      .schedule(id, OperationKind::Start, move |tx, cancel| async move {
        run_streamed_compose(RuntimeAdapter::new(runtime_kind).up(&paths.app_dir, cancel), tx).await
      })
      .await
  }

  pub async fn stop(&self, dirname: String) -> Result<OperationHandle, EngineError> {
    let id = AppIdentifier::derive(&dirname);
    let paths = self.paths(&dirname);
    let runtime_kind = self.runtime_kind;
    self
      .engine
      .schedule(id, OperationKind::Stop, move |tx, cancel| async move {
        run_streamed_compose(RuntimeAdapter::new(runtime_kind).down(&paths.app_dir, false, cancel), tx).await
      })
      .await
  }

  pub async fn recreate(&self, dirname: String) -> Result<OperationHandle, EngineError> {
    let id = AppIdentifier::derive(&dirname);
    let paths = self.paths(&dirname);
    let runtime_kind = self.runtime_kind;
    self
      .engine
      .schedule(id, OperationKind::Recreate, move |tx, cancel| async move {
        let adapter = RuntimeAdapter::new(runtime_kind);
        run_streamed_compose(adapter.down(&paths.app_dir, false, cancel.clone()), tx.clone()).await?;
        run_streamed_compose(adapter.up(&paths.app_dir, cancel), tx).await
      })
      .await
  }

  pub async fn delete(&self, dirname: String) -> Result<OperationHandle, EngineError> {
    let id = AppIdentifier::derive(&dirname);
    let paths = self.paths(&dirname);
    let runtime_kind = self.runtime_kind;
    let proxy = self.proxy.clone();
    let proxy_id = id.clone();
    self
      .engine
      .schedule(id, OperationKind::Delete, move |tx, cancel| async move {
        if !paths.app_dir.exists() {
          return Err(EngineError::AppNotFound(paths.app_dir.display().to_string()));
        }
        run_streamed_compose(RuntimeAdapter::new(runtime_kind).down(&paths.app_dir, true, cancel), tx.clone()).await?;
        proxy.remove(&proxy_id).await.ok();
        tokio::fs::remove_dir_all(&paths.app_dir)
          .await
          .map_err(|e| EngineError::ComposeError(format!("remove app dir: {e}")))?;
        tx.send(ProgressEvent::log("app directory removed")).await.ok();
        Ok(())
      })
      .await
  }

  /// Inspects local vs. remote image digests and recreates only if a
  /// newer digest is available (spec §4.G `update_image`).
  pub async fn update_image(&self, dirname: String) -> Result<OperationHandle, EngineError> {
    let id = AppIdentifier::derive(&dirname);
    let paths = self.paths(&dirname);
    let runtime_kind = self.runtime_kind;
    self
      .engine
      .schedule(id, OperationKind::UpdateImage, move |tx, cancel| async move {
        let doc = ComposeDocument::read(&paths.compose_path)?;
        let adapter = RuntimeAdapter::new(runtime_kind);
        let mut updated_any = false;
        for (service, image) in doc.service_images() {
          tx.send(ProgressEvent::log(format!("checking {service} ({image})"))).await.ok();
          let before = adapter.inspect(&paths.app_dir, &image).await.ok();
          run_streamed_compose(adapter.pull(&paths.app_dir, &image, cancel.clone()), tx.clone()).await?;
          let after = adapter.inspect(&paths.app_dir, &image).await.ok();
          if before.map(|v| v.to_string()) != after.map(|v| v.to_string()) {
            updated_any = true;
          }
        }
        if updated_any {
          run_streamed_compose(adapter.up(&paths.app_dir, cancel), tx.clone()).await?;
          tx.send(ProgressEvent::success("images updated, app recreated")).await.ok();
        } else {
          tx.send(ProgressEvent::success("up to date")).await.ok();
        }
        Ok(())
      })
      .await
  }

  /// Polls `runtime.ps` until every container is running and healthy
  /// (optionally with an HTTP readiness check), or the deadline passes
  /// (spec §4.G `health`).
  pub async fn health(
    &self,
    dirname: String,
    http_url: Option<String>,
    timeout: Duration,
    interval: Duration,
  ) -> Result<OperationHandle, EngineError> {
    let id = AppIdentifier::derive(&dirname);
    let paths = self.paths(&dirname);
    let runtime_kind = self.runtime_kind;
    self
      .engine
      .schedule(id, OperationKind::Health, move |tx, cancel| async move {
        let adapter = RuntimeAdapter::new(runtime_kind);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
          if cancel.is_cancelled() {
            return Err(EngineError::ContextCancelled);
          }
          if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::HealthTimeout);
          }
          let entries = adapter.ps(&paths.app_dir).await.unwrap_or_default();
          let containers_ok = !entries.is_empty()
            && entries
              .iter()
              .all(|e| e.state == "running" && e.health.as_deref().is_none_or(|h| h == "healthy"));
          let http_ok = match &http_url {
            None => true,
            Some(url) => reqwest::get(url).await.map(|r| r.status().is_success() || r.status().is_redirection()).unwrap_or(false),
          };
          if containers_ok && http_ok {
            tx.send(ProgressEvent::success("healthy")).await.ok();
            return Ok(());
          }
          tx.send(ProgressEvent::log("waiting for health")).await.ok();
          tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return Err(EngineError::ContextCancelled),
          }
        }
      })
      .await
  }

  /// Writes `x-ontree.{subdomain,is_exposed}` and enqueues a proxy
  /// reconcile. Implemented synchronously per spec §4.G and the §9
  /// open question (documented in DESIGN.md), not as a persisted
  /// Operation.
  pub async fn expose(&self, dirname: String, subdomain: String) -> Result<(), EngineError> {
    if subdomain.trim().is_empty() || !subdomain.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
      return Err(EngineError::SubdomainInvalid(subdomain));
    }
    let paths = self.paths(&dirname);
    let mut doc = ComposeDocument::read(&paths.compose_path)?;
    let mut meta = doc.get_metadata().unwrap_or_default();
    meta.subdomain = subdomain;
    meta.is_exposed = true;
    doc.set_metadata(&meta)?;
    doc.write(&paths.compose_path)?;
    Ok(())
  }

  pub async fn unexpose(&self, dirname: String) -> Result<(), EngineError> {
    let paths = self.paths(&dirname);
    let mut doc = ComposeDocument::read(&paths.compose_path)?;
    let mut meta = doc.get_metadata().unwrap_or_default();
    meta.is_exposed = false;
    doc.set_metadata(&meta)?;
    doc.write(&paths.compose_path)?;
    Ok(())
  }
}

async fn run_streamed_compose(
  spawned: Result<crate::runtime::SpawnedRun, EngineError>,
  tx: tokio::sync::mpsc::Sender<ProgressEvent>,
) -> Result<(), EngineError> {
  let mut spawned = spawned?;
  let mut parser = ProgressParser::new();
  while let Some(line) = spawned.lines.recv().await {
    // Terminal state is decided by the child's exit code, not by a
    // fatal-looking line on stderr (spec §4.E rule 1).
    let event = parser.parse_line(&line.text);
    tx.send(event).await.ok();
  }
  let success = spawned.wait().await?;
  if success {
    Ok(())
  } else {
    Err(EngineError::ComposeError("compose command exited with a non-zero status".to_string()))
  }
}

async fn set_permissions(path: &std::path::Path, mode: u32) {
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = tokio::fs::metadata(path).await {
      let mut perms = meta.permissions();
      perms.set_mode(mode);
      let _ = tokio::fs::set_permissions(path, perms).await;
    }
  }
  #[cfg(not(unix))]
  {
    let _ = (path, mode);
  }
}

/// Writes `.env` with `COMPOSE_PROJECT_NAME`/`COMPOSE_SEPARATOR` first
/// (spec §4.A, §6 disk layout, §8 property) if not already set by the
/// caller, followed by any extra key/value pairs, idempotently.
async fn write_env_file(
  path: &std::path::Path,
  id: &AppIdentifier,
  extra_env: &[(String, String)],
) -> Result<(), EngineError> {
  let mut lines = vec![
    format!("COMPOSE_PROJECT_NAME={}", crate::naming::compose_project_name(id)),
    "COMPOSE_SEPARATOR=-".to_string(),
  ];
  let mut seen: std::collections::HashSet<&str> = lines.iter().map(|l| l.split('=').next().unwrap()).collect();
  for (key, value) in extra_env {
    if seen.insert(key.as_str()) {
      lines.push(format!("{key}={value}"));
    }
  }
  tokio::fs::write(path, lines.join("\n") + "\n")
    .await
    .map_err(|e| EngineError::EnvReadFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bootstrap::Db;
  use crate::runtime::RuntimeKind;

  async fn test_lifecycle(config: OnTreeConfig) -> Lifecycle {
    let db = Db::open(std::path::Path::new(":memory:")).unwrap();
    let proxy = ProxyReconciler::new("http://localhost:2019".to_string(), None, None);
    Lifecycle::new(Arc::new(config), RuntimeKind::DockerComposePlugin, OperationEngine::new(db), proxy)
  }

  #[tokio::test]
  async fn install_scaffolds_directory_and_injects_host_port() {
    let root = tempfile::tempdir().unwrap();
    let apps_dir = root.path().join("apps");
    let templates_dir = root.path().join("templates");
    tokio::fs::create_dir_all(&templates_dir).await.unwrap();
    tokio::fs::write(
      templates_dir.join("openwebui.yml"),
      "services:\n  {{app_id}}:\n    image: openwebui:latest\n    ports:\n      - \"3080:8080\"\n",
    )
    .await
    .unwrap();

    let config = OnTreeConfig { apps_dir, templates_dir, ..OnTreeConfig::default() };
    let lifecycle = test_lifecycle(config).await;

    let mut handle = lifecycle.install("openwebui".to_string(), "openwebui".to_string(), vec![]).await.unwrap();
    let mut last = None;
    while let Some(event) = handle.events.recv().await {
      last = Some(event);
    }
    assert_eq!(last.unwrap().kind, ontree_entities::ProgressEventKind::Success);

    let paths = lifecycle.paths("openwebui");
    assert!(paths.compose_path.exists());
    assert!(paths.env_path.exists());
    assert!(paths.app_yaml_path.exists());
    assert!(paths.volumes_root.is_dir());
    assert!(paths.mnt_root.is_dir());

    let env = tokio::fs::read_to_string(&paths.env_path).await.unwrap();
    assert!(env.starts_with("COMPOSE_PROJECT_NAME=ontree-openwebui\n"));

    let doc = ComposeDocument::read(&paths.compose_path).unwrap();
    assert_eq!(doc.get_metadata().unwrap().host_port, 3080);
  }

  #[tokio::test]
  async fn install_with_privileged_service_is_rejected_and_creates_no_files() {
    let root = tempfile::tempdir().unwrap();
    let apps_dir = root.path().join("apps");
    let templates_dir = root.path().join("templates");
    tokio::fs::create_dir_all(&templates_dir).await.unwrap();
    tokio::fs::write(
      templates_dir.join("bad.yml"),
      "services:\n  {{app_id}}:\n    image: x:latest\n    privileged: true\n",
    )
    .await
    .unwrap();

    let config = OnTreeConfig { apps_dir: apps_dir.clone(), templates_dir, ..OnTreeConfig::default() };
    let lifecycle = test_lifecycle(config).await;

    let mut handle = lifecycle.install("bad".to_string(), "bad".to_string(), vec![]).await.unwrap();
    let mut last = None;
    while let Some(event) = handle.events.recv().await {
      last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.kind, ontree_entities::ProgressEventKind::Error);
    assert_eq!(last.code.as_deref(), Some("security_violation"));
    assert!(!apps_dir.join("bad").exists());
  }

  #[tokio::test]
  async fn expose_then_unexpose_round_trips_is_exposed() {
    let root = tempfile::tempdir().unwrap();
    let apps_dir = root.path().join("apps");
    let app_dir = apps_dir.join("myapp");
    tokio::fs::create_dir_all(&app_dir).await.unwrap();
    tokio::fs::write(app_dir.join("docker-compose.yml"), "services:\n  web:\n    image: x:latest\n").await.unwrap();

    let config = OnTreeConfig { apps_dir, ..OnTreeConfig::default() };
    let lifecycle = test_lifecycle(config).await;

    lifecycle.expose("myapp".to_string(), "chat".to_string()).await.unwrap();
    let paths = lifecycle.paths("myapp");
    let doc = ComposeDocument::read(&paths.compose_path).unwrap();
    let meta = doc.get_metadata().unwrap();
    assert!(meta.is_exposed);
    assert_eq!(meta.subdomain, "chat");

    lifecycle.unexpose("myapp".to_string()).await.unwrap();
    let doc = ComposeDocument::read(&paths.compose_path).unwrap();
    assert!(!doc.get_metadata().unwrap().is_exposed);
  }

  #[tokio::test]
  async fn expose_rejects_invalid_subdomain() {
    let root = tempfile::tempdir().unwrap();
    let config = OnTreeConfig { apps_dir: root.path().join("apps"), ..OnTreeConfig::default() };
    let lifecycle = test_lifecycle(config).await;
    let err = lifecycle.expose("myapp".to_string(), "not valid!".to_string()).await.unwrap_err();
    assert_eq!(err.code(), "subdomain_invalid");
  }
}
