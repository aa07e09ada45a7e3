//! Operation engine (spec §4.F): schedules, supervises, persists and
//! streams long-running jobs. Per-app mutations are serialised by a
//! per-`app_id` lock; a stale-operation reaper sweeps rows orphaned by
//! a process restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ontree_entities::{AppIdentifier, EngineError, Operation, OperationKind, OperationState, ProgressEvent};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bootstrap::Db;

/// Threshold past which a pending/in_progress operation found at
/// startup or by the reaper is considered orphaned (spec §3, §8
/// scenario 6).
pub const STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);
const SUBSCRIBER_BUFFER: usize = 256;

struct Subscriber {
  tx: mpsc::Sender<ProgressEvent>,
  dropped: u64,
}

struct RunningOperation {
  cancel: CancellationToken,
  subscribers: Mutex<Vec<Subscriber>>,
}

/// Handle to a scheduled operation: its id plus a channel of its
/// `ProgressEvent`s (spec §3).
pub struct OperationHandle {
  pub id: String,
  pub events: mpsc::Receiver<ProgressEvent>,
}

#[derive(Clone)]
pub struct OperationEngine {
  db: Db,
  app_locks: Arc<Mutex<HashMap<AppIdentifier, Arc<Mutex<()>>>>>,
  running: Arc<Mutex<HashMap<String, Arc<RunningOperation>>>>,
}

impl OperationEngine {
  pub fn new(db: Db) -> Self {
    Self { db, app_locks: Arc::new(Mutex::new(HashMap::new())), running: Arc::new(Mutex::new(HashMap::new())) }
  }

  async fn app_lock(&self, app_id: &AppIdentifier) -> Arc<Mutex<()>> {
    let mut locks = self.app_locks.lock().await;
    locks.entry(app_id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
  }

  /// Runs `work` as a new operation. `work` receives a sender to push
  /// `ProgressEvent`s and a `CancellationToken` it must honour; it
  /// returns `Ok(())` on success or an `EngineError` which becomes the
  /// terminal error event and the persisted failure code.
  ///
  /// Fails fast with `operation_in_progress`, without touching the
  /// filesystem, if another mutating operation already holds this
  /// app's lock (spec §4.F, §9 design notes).
  pub async fn schedule<F, Fut>(
    &self,
    app_id: AppIdentifier,
    kind: OperationKind,
    work: F,
  ) -> Result<OperationHandle, EngineError>
  where
    F: FnOnce(mpsc::Sender<ProgressEvent>, CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), EngineError>> + Send + 'static,
  {
    let app_lock = self.app_lock(&app_id).await;
    let guard = app_lock.try_lock_owned().map_err(|_| EngineError::OperationInProgress)?;

    let id = Uuid::new_v4().to_string();
    let cancel = CancellationToken::new();
    let (internal_tx, mut internal_rx) = mpsc::channel::<ProgressEvent>(SUBSCRIBER_BUFFER);
    let (subscriber_tx, subscriber_rx) = mpsc::channel::<ProgressEvent>(SUBSCRIBER_BUFFER);

    let running = Arc::new(RunningOperation {
      cancel: cancel.clone(),
      subscribers: Mutex::new(vec![Subscriber { tx: subscriber_tx, dropped: 0 }]),
    });
    self.running.lock().await.insert(id.clone(), running.clone());

    let op = Operation::new(id.clone(), app_id, kind);
    self.db.insert_operation(op).await?;
    self.db.update_operation_state(id.clone(), OperationState::InProgress, None).await?;

    let db = self.db.clone();
    let running_map = self.running.clone();
    let id_for_fanout = id.clone();
    tokio::spawn(async move {
      let mut guard = Some(guard);
      while let Some(event) = internal_rx.recv().await {
        fan_out(&running, event).await;
      }
      drop(guard.take());
    });

    let db_for_worker = db.clone();
    let id_for_worker = id.clone();
    let cancel_for_worker = cancel.clone();
    tokio::spawn(async move {
      let result = work(internal_tx.clone(), cancel_for_worker.clone()).await;
      let (state, error, terminal) = match &result {
        Ok(()) => (OperationState::Completed, None, ProgressEvent::success("operation completed")),
        Err(e) if cancel_for_worker.is_cancelled() => {
          (OperationState::Cancelled, Some(e.to_string()), ProgressEvent::error(e.to_string(), "context_cancelled"))
        }
        Err(e) => (OperationState::Failed, Some(e.to_string()), ProgressEvent::error(e.to_string(), e.code())),
      };
      let _ = db_for_worker.update_operation_state(id_for_worker, state, error).await;
      let _ = internal_tx.send(terminal).await;
      drop(internal_tx);
      running_map.lock().await.remove(&id_for_fanout);
    });

    Ok(OperationHandle { id, events: subscriber_rx })
  }

  /// Adds another subscriber to an already-running operation. Late
  /// subscribers receive only future events (spec §4.F).
  pub async fn subscribe(&self, operation_id: &str) -> Option<mpsc::Receiver<ProgressEvent>> {
    let running = self.running.lock().await;
    let op = running.get(operation_id)?;
    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    op.subscribers.lock().await.push(Subscriber { tx, dropped: 0 });
    Some(rx)
  }

  pub async fn cancel(&self, operation_id: &str) -> bool {
    let running = self.running.lock().await;
    if let Some(op) = running.get(operation_id) {
      op.cancel.cancel();
      true
    } else {
      false
    }
  }

  /// Startup + periodic sweep of pending/in_progress rows left behind
  /// by a crash (spec §3, §4.F, §8 scenario 6). No channel is
  /// materialised for orphaned rows.
  pub async fn sweep_stale(&self) -> Result<usize, EngineError> {
    self.db.sweep_stale_operations(chrono::Duration::from_std(STALE_THRESHOLD).unwrap()).await
  }
}

async fn fan_out(running: &RunningOperation, event: ProgressEvent) {
  let mut subs = running.subscribers.lock().await;
  for sub in subs.iter_mut() {
    if sub.dropped > 0 {
      let marker = ProgressEvent::dropped_events(sub.dropped);
      if sub.tx.try_send(marker).is_ok() {
        sub.dropped = 0;
      }
    }
    if event.is_terminal() {
      // Terminal events are never dropped — wait for room.
      let _ = sub.tx.send(event.clone()).await;
    } else if sub.tx.try_send(event.clone()).is_err() {
      sub.dropped += 1;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ontree_entities::ProgressEventKind;

  fn test_engine() -> OperationEngine {
    OperationEngine::new(Db::open(std::path::Path::new(":memory:")).unwrap())
  }

  #[tokio::test]
  async fn successful_operation_emits_exactly_one_terminal_event_last() {
    let engine = test_engine();
    let mut handle = engine
      .schedule(AppIdentifier::derive("app"), OperationKind::Start, |tx, _cancel| async move {
        tx.send(ProgressEvent::log("starting")).await.ok();
        Ok(())
      })
      .await
      .unwrap();

    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
      events.push(event);
    }
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(events.last().unwrap().kind, ProgressEventKind::Success);
  }

  #[tokio::test]
  async fn fatal_looking_log_line_does_not_produce_a_second_terminal_event() {
    let engine = test_engine();
    let mut handle = engine
      .schedule(AppIdentifier::derive("app"), OperationKind::Start, |tx, _cancel| async move {
        tx.send(ProgressEvent::fatal_log("Error: failed to pull layer, retrying")).await.ok();
        Ok(())
      })
      .await
      .unwrap();

    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
      events.push(event);
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(events.last().unwrap().kind, ProgressEventKind::Success);
    assert_eq!(events[0].kind, ProgressEventKind::Error);
    assert!(!events[0].is_terminal());
  }

  #[tokio::test]
  async fn failed_operation_emits_error_with_code() {
    let engine = test_engine();
    let mut handle = engine
      .schedule(AppIdentifier::derive("app"), OperationKind::Start, |_tx, _cancel| async move {
        Err(EngineError::ComposeError("boom".to_string()))
      })
      .await
      .unwrap();
    let mut last = None;
    while let Some(event) = handle.events.recv().await {
      last = Some(event);
    }
    let last = last.unwrap();
    assert_eq!(last.kind, ProgressEventKind::Error);
    assert_eq!(last.code.as_deref(), Some("compose_error"));
  }

  #[tokio::test]
  async fn second_mutating_op_on_same_app_fails_fast() {
    let engine = test_engine();
    let app = AppIdentifier::derive("app");
    let _first = engine
      .schedule(app.clone(), OperationKind::Start, |_tx, _cancel| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
      })
      .await
      .unwrap();

    let second = engine.schedule(app, OperationKind::Stop, |_tx, _cancel| async move { Ok(()) }).await;
    assert!(matches!(second, Err(EngineError::OperationInProgress)));
  }
}
