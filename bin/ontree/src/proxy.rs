//! Proxy reconciler (spec §4.J): converts the exposed-app set into
//! reverse-proxy routes via the proxy's admin API (JSON-over-HTTP,
//! `http://localhost:2019` by default — spec §6).

use ontree_entities::{AppIdentifier, EngineError, ProxyRoute};
use serde_json::json;

use crate::inventory::{self, AppSummary};
use crate::runtime::RuntimeKind;

#[derive(Clone)]
pub struct ProxyReconciler {
  admin_url: String,
  client: reqwest::Client,
  public_base_domain: Option<String>,
  tailscale_base_domain: Option<String>,
}

impl ProxyReconciler {
  pub fn new(admin_url: String, public_base_domain: Option<String>, tailscale_base_domain: Option<String>) -> Self {
    Self { admin_url, client: reqwest::Client::new(), public_base_domain, tailscale_base_domain }
  }

  fn hosts_for(&self, subdomain: &str) -> Vec<String> {
    let mut hosts = Vec::new();
    if let Some(domain) = &self.public_base_domain {
      hosts.push(format!("{subdomain}.{domain}"));
    }
    if let Some(domain) = &self.tailscale_base_domain {
      hosts.push(format!("{subdomain}.{domain}"));
    }
    hosts
  }

  async fn ensure_http_app(&self) -> Result<(), EngineError> {
    let url = format!("{}/config/apps/http/servers/ontree", self.admin_url);
    let existing = self.client.get(&url).send().await;
    if matches!(&existing, Ok(resp) if resp.status().is_success()) {
      return Ok(());
    }
    let body = json!({ "listen": [":443", ":80"], "routes": [] });
    let resp = self
      .client
      .put(&url)
      .json(&body)
      .send()
      .await
      .map_err(|e| EngineError::ProxyUnavailable(e.to_string()))?;
    if !resp.status().is_success() {
      let status = resp.status();
      let body = resp.text().await.unwrap_or_default();
      return Err(EngineError::ProxyError(format!("{status}: {body}")));
    }
    Ok(())
  }

  /// Ensures exactly one route exists with the computed ID and
  /// expected upstream for an exposed app (spec §4.J).
  pub async fn add_or_update(&self, app_id: &AppIdentifier, subdomain: &str, host_port: u32) -> Result<(), EngineError> {
    let hosts = self.hosts_for(subdomain);
    if hosts.is_empty() {
      return Err(EngineError::NoDomainsConfigured);
    }
    self.ensure_http_app().await?;

    let route = ProxyRoute { route_id: ProxyRoute::route_id_for(app_id), hosts, upstream: ProxyRoute::upstream_for(host_port) };
    let url = format!("{}/id/{}", self.admin_url, route.route_id);
    let body = json!({
      "@id": route.route_id,
      "match": [{ "host": route.hosts }],
      "handle": [{ "handler": "reverse_proxy", "upstreams": [{ "dial": route.upstream }] }],
    });
    let resp = self.client.put(&url).json(&body).send().await.map_err(|e| EngineError::ProxyUnavailable(e.to_string()))?;
    if !resp.status().is_success() {
      let status = resp.status();
      let body = resp.text().await.unwrap_or_default();
      return Err(EngineError::ProxyError(format!("{status}: {body}")));
    }
    Ok(())
  }

  pub async fn remove(&self, app_id: &AppIdentifier) -> Result<(), EngineError> {
    let route_id = ProxyRoute::route_id_for(app_id);
    let url = format!("{}/id/{route_id}", self.admin_url);
    let resp = self.client.delete(&url).send().await.map_err(|e| EngineError::ProxyUnavailable(e.to_string()))?;
    if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
      let status = resp.status();
      return Err(EngineError::ProxyError(format!("{status}")));
    }
    Ok(())
  }

  /// For every exposed app in `apps`, ensures exactly one route; for
  /// every app present but not (or no longer) exposed, removes its
  /// route (spec §4.J). Apps whose directory has already been deleted
  /// are cleaned up at delete time instead (`Lifecycle::delete` calls
  /// `remove` directly) — this pass never sees them, since they are
  /// absent from `apps` to begin with.
  pub async fn reconcile_all(&self, apps: &[AppSummary]) -> Result<(), EngineError> {
    for app in apps {
      if app.metadata.is_exposed && !app.metadata.subdomain.is_empty() {
        self.add_or_update(&app.id, &app.metadata.subdomain, app.metadata.host_port).await?;
      } else {
        self.remove(&app.id).await.ok();
      }
    }
    Ok(())
  }

  /// Periodically re-derives routes from the on-disk inventory — the
  /// "subscribes to metadata changes" language in spec §4.J/§2, given
  /// this repo has no separate metadata change-notification bus. Errors
  /// from a single reconcile pass are logged and the loop continues;
  /// the next pass will retry.
  pub async fn run(
    &self,
    cancel: tokio_util::sync::CancellationToken,
    apps_dir: &std::path::Path,
    runtime_kind: RuntimeKind,
    interval: std::time::Duration,
  ) {
    let adapter = crate::runtime::RuntimeAdapter::new(runtime_kind);
    loop {
      if cancel.is_cancelled() {
        return;
      }
      let apps = inventory::list_apps(apps_dir, &adapter).await;
      if let Err(err) = self.reconcile_all(&apps).await {
        tracing::warn!(error = %err, "proxy reconcile pass failed");
      }
      tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = cancel.cancelled() => return,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hosts_combine_public_and_tailscale_domains() {
    let reconciler = ProxyReconciler::new(
      "http://localhost:2019".to_string(),
      Some("example.com".to_string()),
      Some("ts.net".to_string()),
    );
    assert_eq!(reconciler.hosts_for("chat"), vec!["chat.example.com".to_string(), "chat.ts.net".to_string()]);
  }

  #[test]
  fn no_domains_configured_yields_empty_hosts() {
    let reconciler = ProxyReconciler::new("http://localhost:2019".to_string(), None, None);
    assert!(reconciler.hosts_for("chat").is_empty());
  }
}
