//! Minimal HTTP surface (spec §1, §6): health probe and operation
//! server-sent events. Full HTTP routing, session/cookie auth and HTML
//! rendering are explicit Non-goals — this module only adapts the
//! engine's operation streams to SSE, the same consumer-agnostic
//! contract described in spec §9 ("HTTP handlers adapt the stream to
//! server-sent events; CLIs print lines").

use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::engine::OperationEngine;

#[derive(Clone)]
struct ServeState {
  engine: OperationEngine,
}

async fn health() -> impl IntoResponse {
  Json(serde_json::json!({ "status": "ok" }))
}

async fn operation_events(
  State(state): State<Arc<ServeState>>,
  AxumPath(operation_id): AxumPath<String>,
) -> impl IntoResponse {
  match state.engine.subscribe(&operation_id).await {
    Some(rx) => {
      let stream = ReceiverStream::new(rx).map(|event| {
        let json = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, std::convert::Infallible>(Event::default().data(json))
      });
      Sse::new(stream).into_response()
    }
    None => axum::http::StatusCode::NOT_FOUND.into_response(),
  }
}

fn router(engine: OperationEngine) -> Router {
  let state = Arc::new(ServeState { engine });
  Router::new()
    .route("/healthz", get(health))
    .route("/operations/{id}/events", get(operation_events))
    .with_state(state)
}

/// Binds and serves until the process is terminated (spec §6 `serve`).
pub async fn run(listen_addr: &str, port: u16, engine: OperationEngine) -> anyhow::Result<()> {
  let app = router(engine);
  let addr = format!("{listen_addr}:{port}");
  let listener = tokio::net::TcpListener::bind(&addr).await?;
  tracing::info!(%addr, "serving");
  axum::serve(listener, app).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bootstrap::Db;

  #[tokio::test]
  async fn unknown_operation_id_returns_404() {
    let engine = OperationEngine::new(Db::open(std::path::Path::new(":memory:")).unwrap());
    let state = Arc::new(ServeState { engine });
    let response = operation_events(State(state), AxumPath("nope".to_string())).await.into_response();
    assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
  }
}

