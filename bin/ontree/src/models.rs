//! Model manager (spec §4.H): install/list/health models inside the
//! designated inference container, identified by the well-known label
//! `ontree.inference=true`.

use ontree_entities::{EngineError, OperationKind, ProgressEvent};

use crate::engine::{OperationEngine, OperationHandle};
use crate::progress::ProgressParser;
use crate::runtime::{RuntimeAdapter, RuntimeKind};

const INFERENCE_LABEL: &str = "ontree.inference=true";

#[derive(Clone)]
pub struct ModelManager {
  pub runtime_kind: RuntimeKind,
  pub engine: OperationEngine,
  pub apps_dir: std::path::PathBuf,
}

impl ModelManager {
  pub fn new(runtime_kind: RuntimeKind, engine: OperationEngine, apps_dir: std::path::PathBuf) -> Self {
    Self { runtime_kind, engine, apps_dir }
  }

  pub async fn model_install(&self, name: String) -> Result<OperationHandle, EngineError> {
    let runtime_kind = self.runtime_kind;
    let apps_dir = self.apps_dir.clone();
    // app_id is synthetic: model installs aren't scoped to one app, but
    // the engine requires a lock key, so a well-known reserved id keeps
    // concurrent model installs serialised against each other.
    let lock_id = ontree_entities::AppIdentifier::derive("__models__");
    self
      .engine
      .schedule(lock_id, OperationKind::ModelInstall, move |tx, cancel| async move {
        let adapter = RuntimeAdapter::new(runtime_kind);
        let container = find_inference_container(&adapter, &apps_dir).await?;
        let mut spawned = adapter.exec_streamed(&apps_dir, &container, &["ollama".to_string(), "pull".to_string(), name], cancel)?;
        let mut parser = ProgressParser::new();
        while let Some(line) = spawned.lines.recv().await {
          tx.send(parser.parse_line(&line.text)).await.ok();
        }
        if spawned.wait().await? {
          Ok(())
        } else {
          Err(EngineError::ExecFailed("ollama pull failed".to_string()))
        }
      })
      .await
  }

  /// Lists installed models by exec-ing `ollama list` and parsing its
  /// tabular output: skip the header, take the first field per line.
  pub async fn model_list(&self) -> Result<Vec<String>, EngineError> {
    let adapter = RuntimeAdapter::new(self.runtime_kind);
    let container = find_inference_container(&adapter, &self.apps_dir).await?;
    let log = adapter.exec(&self.apps_dir, &container, &["ollama".to_string(), "list".to_string()]).await?;
    Ok(parse_ollama_list(&log.stdout))
  }

  pub async fn model_health(
    &self,
    name: String,
    timeout: std::time::Duration,
    interval: std::time::Duration,
  ) -> Result<OperationHandle, EngineError> {
    let runtime_kind = self.runtime_kind;
    let apps_dir = self.apps_dir.clone();
    let lock_id = ontree_entities::AppIdentifier::derive("__models__");
    self
      .engine
      .schedule(lock_id, OperationKind::ModelHealth, move |tx, cancel| async move {
        let adapter = RuntimeAdapter::new(runtime_kind);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
          if cancel.is_cancelled() {
            return Err(EngineError::ContextCancelled);
          }
          if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::HealthTimeout);
          }
          let container = find_inference_container(&adapter, &apps_dir).await;
          if let Ok(container) = container
            && let Ok(log) = adapter.exec(&apps_dir, &container, &["ollama".to_string(), "list".to_string()]).await
            && parse_ollama_list(&log.stdout).iter().any(|m| m == &name)
          {
            tx.send(ProgressEvent::success(format!("model {name} is available"))).await.ok();
            return Ok(());
          }
          tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return Err(EngineError::ContextCancelled),
          }
        }
      })
      .await
  }
}

async fn find_inference_container(
  adapter: &RuntimeAdapter,
  apps_dir: &std::path::Path,
) -> Result<String, EngineError> {
  let entries = adapter.ps(apps_dir).await.unwrap_or_default();
  for entry in &entries {
    if let Ok(inspect) = adapter.inspect(apps_dir, &entry.name).await
      && let Some(labels) = inspect.pointer("/0/Config/Labels").or_else(|| inspect.get("Config").and_then(|c| c.get("Labels")))
      && labels.to_string().contains(INFERENCE_LABEL)
    {
      return Ok(entry.name.clone());
    }
  }
  Err(EngineError::OllamaNotRunning)
}

fn parse_ollama_list(stdout: &str) -> Vec<String> {
  stdout
    .lines()
    .skip(1)
    .filter_map(|line| line.split_whitespace().next())
    .map(str::to_string)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_ollama_list_skipping_header() {
    let stdout = "NAME            SIZE\nllama3:latest   4.7 GB\nmistral:latest  4.1 GB\n";
    let models = parse_ollama_list(stdout);
    assert_eq!(models, vec!["llama3:latest".to_string(), "mistral:latest".to_string()]);
  }

  #[test]
  fn empty_list_output_yields_no_models() {
    assert!(parse_ollama_list("NAME  SIZE\n").is_empty());
  }
}
