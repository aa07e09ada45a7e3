//! Embedded, file-based relational store (spec §4.L). Schema applied by
//! numbered, idempotent migrations tracked in a history table so they
//! never reapply. `rusqlite` calls are blocking, so every public method
//! runs its connection access inside `spawn_blocking` — the standard
//! way to mix a synchronous database driver into an async binary.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use ontree_entities::{EngineError, Operation, OperationKind, OperationState, SetupState, User, VitalsSample};
use rusqlite::{Connection, OptionalExtension, params};

const MIGRATIONS: &[(i64, &str)] = &[
  (
    1,
    "CREATE TABLE IF NOT EXISTS operations (
      id TEXT PRIMARY KEY,
      app_id TEXT NOT NULL,
      kind TEXT NOT NULL,
      state TEXT NOT NULL,
      started_at TEXT NOT NULL,
      finished_at TEXT,
      error TEXT,
      last_event_seq INTEGER NOT NULL DEFAULT 0
    )",
  ),
  (
    2,
    "CREATE TABLE IF NOT EXISTS setup_state (
      id INTEGER PRIMARY KEY CHECK (id = 1),
      complete INTEGER NOT NULL,
      node_name TEXT NOT NULL,
      node_icon TEXT NOT NULL
    )",
  ),
  (
    3,
    "CREATE TABLE IF NOT EXISTS users (
      username TEXT PRIMARY KEY,
      password_hash TEXT NOT NULL,
      is_staff INTEGER NOT NULL,
      is_superuser INTEGER NOT NULL,
      date_joined TEXT NOT NULL
    )",
  ),
  (
    4,
    "CREATE TABLE IF NOT EXISTS vitals (
      timestamp TEXT PRIMARY KEY,
      cpu_percent REAL NOT NULL,
      mem_percent REAL NOT NULL,
      disk_percent REAL NOT NULL,
      net_bytes_in_cumulative INTEGER NOT NULL,
      net_bytes_out_cumulative INTEGER NOT NULL,
      reset INTEGER NOT NULL
    )",
  ),
];

#[derive(Clone)]
pub struct Db {
  conn: Arc<Mutex<Connection>>,
}

impl Db {
  pub fn open(path: &Path) -> Result<Self, EngineError> {
    let conn = Connection::open(path).map_err(|e| EngineError::ComposeError(format!("db open: {e}")))?;
    let db = Self { conn: Arc::new(Mutex::new(conn)) };
    db.migrate_sync()?;
    Ok(db)
  }

  fn migrate_sync(&self) -> Result<(), EngineError> {
    let conn = self.conn.lock().unwrap();
    conn
      .execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL)",
      )
      .map_err(db_err)?;
    for (version, sql) in MIGRATIONS {
      let already: Option<i64> = conn
        .query_row("SELECT version FROM schema_migrations WHERE version = ?1", params![version], |r| r.get(0))
        .optional()
        .map_err(db_err)?;
      if already.is_some() {
        continue;
      }
      conn.execute_batch(sql).map_err(db_err)?;
      conn
        .execute(
          "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
          params![version, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
    }
    Ok(())
  }

  pub async fn insert_operation(&self, op: Operation) -> Result<(), EngineError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      conn
        .execute(
          "INSERT INTO operations (id, app_id, kind, state, started_at, finished_at, error, last_event_seq)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          params![
            op.id,
            op.app_id.as_str(),
            op.kind.to_string(),
            state_str(op.state),
            op.started_at.to_rfc3339(),
            op.finished_at.map(|t| t.to_rfc3339()),
            op.error,
            op.last_event_seq as i64,
          ],
        )
        .map_err(db_err)
    })
    .await
    .map_err(join_err)??;
    Ok(())
  }

  pub async fn update_operation_state(
    &self,
    id: String,
    state: OperationState,
    error: Option<String>,
  ) -> Result<(), EngineError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      let finished_at = state.is_terminal().then(|| Utc::now().to_rfc3339());
      conn
        .execute(
          "UPDATE operations SET state = ?1, error = ?2, finished_at = ?3 WHERE id = ?4",
          params![state_str(state), error, finished_at, id],
        )
        .map_err(db_err)
    })
    .await
    .map_err(join_err)??;
    Ok(())
  }

  /// Marks pending/in_progress rows older than `threshold` as failed
  /// with `orphaned` (spec §4.F, §8 scenario 6). Returns the number
  /// swept.
  pub async fn sweep_stale_operations(&self, threshold: chrono::Duration) -> Result<usize, EngineError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      let cutoff = (Utc::now() - threshold).to_rfc3339();
      conn
        .execute(
          "UPDATE operations SET state = 'failed', error = 'orphaned', finished_at = ?1
           WHERE state IN ('pending', 'in_progress') AND started_at < ?2",
          params![Utc::now().to_rfc3339(), cutoff],
        )
        .map_err(db_err)
    })
    .await
    .map_err(join_err)?
  }

  /// Past `Operation` rows for one app, newest first (spec §4.F history
  /// introspection), since the store is otherwise write-only from the
  /// CLI's point of view.
  pub async fn list_operations_for_app(&self, app_id: &str, limit: u32) -> Result<Vec<Operation>, EngineError> {
    let conn = self.conn.clone();
    let app_id = app_id.to_string();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      let mut stmt = conn
        .prepare(
          "SELECT id, app_id, kind, state, started_at, finished_at, error, last_event_seq
           FROM operations WHERE app_id = ?1 ORDER BY started_at DESC LIMIT ?2",
        )
        .map_err(db_err)?;
      let rows = stmt
        .query_map(params![app_id, limit], row_to_operation)
        .map_err(db_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err)?;
      Ok(rows)
    })
    .await
    .map_err(join_err)?
  }

  pub async fn get_setup_state(&self) -> Result<SetupState, EngineError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      conn
        .query_row("SELECT complete, node_name, node_icon FROM setup_state WHERE id = 1", [], |r| {
          Ok(SetupState { complete: r.get::<_, i64>(0)? != 0, node_name: r.get(1)?, node_icon: r.get(2)? })
        })
        .optional()
        .map_err(db_err)
        .map(|opt| opt.unwrap_or_default())
    })
    .await
    .map_err(join_err)?
  }

  /// Atomically creates the first user and marks setup complete. Fails
  /// with `setup_already_completed` if already done (spec §4.L).
  pub async fn complete_setup(&self, user: User, node_name: String, node_icon: String) -> Result<(), EngineError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let mut conn = conn.lock().unwrap();
      let tx = conn.transaction().map_err(db_err)?;
      let already: Option<i64> = tx
        .query_row("SELECT complete FROM setup_state WHERE id = 1", [], |r| r.get(0))
        .optional()
        .map_err(db_err)?;
      if already == Some(1) {
        return Err(EngineError::SetupAlreadyCompleted);
      }
      tx.execute(
        "INSERT INTO users (username, password_hash, is_staff, is_superuser, date_joined)
         VALUES (?1, ?2, 1, 1, ?3)",
        params![user.username, user.password_hash, user.date_joined.to_rfc3339()],
      )
      .map_err(db_err)?;
      tx.execute(
        "INSERT INTO setup_state (id, complete, node_name, node_icon) VALUES (1, 1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET complete = 1, node_name = excluded.node_name, node_icon = excluded.node_icon",
        params![node_name, node_icon],
      )
      .map_err(db_err)?;
      tx.commit().map_err(db_err)?;
      Ok(())
    })
    .await
    .map_err(join_err)?
  }

  pub async fn insert_vitals_sample(&self, sample: VitalsSample) -> Result<(), EngineError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      conn
        .execute(
          "INSERT OR REPLACE INTO vitals
           (timestamp, cpu_percent, mem_percent, disk_percent, net_bytes_in_cumulative, net_bytes_out_cumulative, reset)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          params![
            sample.timestamp.to_rfc3339(),
            sample.cpu_percent,
            sample.mem_percent,
            sample.disk_percent,
            sample.net_bytes_in_cumulative as i64,
            sample.net_bytes_out_cumulative as i64,
            sample.reset as i64,
          ],
        )
        .map_err(db_err)
    })
    .await
    .map_err(join_err)??;
    Ok(())
  }

  /// Most recent sample, used to compute the next sample's reset flag.
  pub async fn latest_vitals_sample(&self) -> Result<Option<VitalsSample>, EngineError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      conn
        .query_row(
          "SELECT timestamp, cpu_percent, mem_percent, disk_percent, net_bytes_in_cumulative, net_bytes_out_cumulative, reset
           FROM vitals ORDER BY timestamp DESC LIMIT 1",
          [],
          row_to_vitals_sample,
        )
        .optional()
        .map_err(db_err)
    })
    .await
    .map_err(join_err)?
  }

  /// Samples within `[from, to]`, ordered ascending (spec §4.K).
  pub async fn query_vitals_range(
    &self,
    from: chrono::DateTime<Utc>,
    to: chrono::DateTime<Utc>,
  ) -> Result<Vec<VitalsSample>, EngineError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      let mut stmt = conn
        .prepare(
          "SELECT timestamp, cpu_percent, mem_percent, disk_percent, net_bytes_in_cumulative, net_bytes_out_cumulative, reset
           FROM vitals WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY timestamp ASC",
        )
        .map_err(db_err)?;
      let rows = stmt
        .query_map(params![from.to_rfc3339(), to.to_rfc3339()], row_to_vitals_sample)
        .map_err(db_err)?;
      rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    })
    .await
    .map_err(join_err)?
  }

  /// Deletes samples older than the retention window (spec §4.K).
  pub async fn prune_vitals_older_than(&self, cutoff: chrono::DateTime<Utc>) -> Result<usize, EngineError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().unwrap();
      conn
        .execute("DELETE FROM vitals WHERE timestamp < ?1", params![cutoff.to_rfc3339()])
        .map_err(db_err)
    })
    .await
    .map_err(join_err)?
  }
}

fn row_to_vitals_sample(r: &rusqlite::Row) -> rusqlite::Result<VitalsSample> {
  let ts: String = r.get(0)?;
  Ok(VitalsSample {
    timestamp: chrono::DateTime::parse_from_rfc3339(&ts)
      .map(|dt| dt.with_timezone(&Utc))
      .unwrap_or_else(|_| Utc::now()),
    cpu_percent: r.get(1)?,
    mem_percent: r.get(2)?,
    disk_percent: r.get(3)?,
    net_bytes_in_cumulative: r.get::<_, i64>(4)? as u64,
    net_bytes_out_cumulative: r.get::<_, i64>(5)? as u64,
    reset: r.get::<_, i64>(6)? != 0,
  })
}

fn row_to_operation(r: &rusqlite::Row) -> rusqlite::Result<Operation> {
  let started_at: String = r.get(4)?;
  let finished_at: Option<String> = r.get(5)?;
  Ok(Operation {
    id: r.get(0)?,
    app_id: ontree_entities::AppIdentifier::derive(&r.get::<_, String>(1)?),
    kind: parse_kind(&r.get::<_, String>(2)?),
    state: parse_state(&r.get::<_, String>(3)?),
    started_at: chrono::DateTime::parse_from_rfc3339(&started_at).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now()),
    finished_at: finished_at.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
    error: r.get(6)?,
    last_event_seq: r.get::<_, i64>(7)? as u64,
  })
}

fn parse_kind(raw: &str) -> OperationKind {
  match raw {
    "install" => OperationKind::Install,
    "start" => OperationKind::Start,
    "stop" => OperationKind::Stop,
    "recreate" => OperationKind::Recreate,
    "delete" => OperationKind::Delete,
    "update_image" => OperationKind::UpdateImage,
    "expose" => OperationKind::Expose,
    "unexpose" => OperationKind::Unexpose,
    "model_install" => OperationKind::ModelInstall,
    "health" => OperationKind::Health,
    _ => OperationKind::ModelHealth,
  }
}

fn parse_state(raw: &str) -> OperationState {
  match raw {
    "pending" => OperationState::Pending,
    "in_progress" => OperationState::InProgress,
    "completed" => OperationState::Completed,
    "cancelled" => OperationState::Cancelled,
    _ => OperationState::Failed,
  }
}

fn state_str(state: OperationState) -> &'static str {
  match state {
    OperationState::Pending => "pending",
    OperationState::InProgress => "in_progress",
    OperationState::Completed => "completed",
    OperationState::Failed => "failed",
    OperationState::Cancelled => "cancelled",
  }
}

fn db_err(e: rusqlite::Error) -> EngineError {
  EngineError::ComposeError(format!("db: {e}"))
}

fn join_err(e: tokio::task::JoinError) -> EngineError {
  EngineError::ComposeError(format!("db task panicked: {e}"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use ontree_entities::AppIdentifier;

  async fn test_db() -> Db {
    Db::open(std::path::Path::new(":memory:")).unwrap()
  }

  #[tokio::test]
  async fn migrations_are_idempotent() {
    let db = test_db().await;
    db.migrate_sync().unwrap();
    db.migrate_sync().unwrap();
  }

  #[tokio::test]
  async fn setup_state_defaults_incomplete() {
    let db = test_db().await;
    let state = db.get_setup_state().await.unwrap();
    assert!(!state.complete);
  }

  #[tokio::test]
  async fn complete_setup_twice_fails() {
    let db = test_db().await;
    let user = User {
      username: "admin".to_string(),
      password_hash: "hash".to_string(),
      is_staff: true,
      is_superuser: true,
      date_joined: Utc::now(),
    };
    db.complete_setup(user.clone(), "Test".to_string(), "tree1".to_string()).await.unwrap();
    let err = db.complete_setup(user, "Test".to_string(), "tree1".to_string()).await.unwrap_err();
    assert_eq!(err.code(), "setup_already_completed");
  }

  #[tokio::test]
  async fn vitals_round_trip_and_range_query() {
    let db = test_db().await;
    let sample = VitalsSample {
      timestamp: Utc::now(),
      cpu_percent: 12.5,
      mem_percent: 40.0,
      disk_percent: 55.0,
      net_bytes_in_cumulative: 1000,
      net_bytes_out_cumulative: 2000,
      reset: false,
    };
    db.insert_vitals_sample(sample).await.unwrap();
    let latest = db.latest_vitals_sample().await.unwrap().unwrap();
    assert_eq!(latest.net_bytes_in_cumulative, 1000);

    let range = db
      .query_vitals_range(Utc::now() - chrono::Duration::minutes(1), Utc::now() + chrono::Duration::minutes(1))
      .await
      .unwrap();
    assert_eq!(range.len(), 1);
  }

  #[tokio::test]
  async fn prune_vitals_removes_old_samples() {
    let db = test_db().await;
    let old = VitalsSample {
      timestamp: Utc::now() - chrono::Duration::days(10),
      cpu_percent: 1.0,
      mem_percent: 1.0,
      disk_percent: 1.0,
      net_bytes_in_cumulative: 0,
      net_bytes_out_cumulative: 0,
      reset: false,
    };
    db.insert_vitals_sample(old).await.unwrap();
    let pruned = db.prune_vitals_older_than(Utc::now() - chrono::Duration::days(7)).await.unwrap();
    assert_eq!(pruned, 1);
  }

  #[tokio::test]
  async fn stale_pending_operation_is_swept_to_orphaned() {
    let db = test_db().await;
    let mut op = Operation::new("op1".to_string(), AppIdentifier::derive("app"), OperationKind::Install);
    op.started_at = Utc::now() - chrono::Duration::minutes(10);
    db.insert_operation(op).await.unwrap();
    let swept = db.sweep_stale_operations(chrono::Duration::minutes(5)).await.unwrap();
    assert_eq!(swept, 1);
  }

  #[tokio::test]
  async fn list_operations_for_app_orders_newest_first() {
    let db = test_db().await;
    let app_id = AppIdentifier::derive("app");
    let mut older = Operation::new("op1".to_string(), app_id.clone(), OperationKind::Install);
    older.started_at = Utc::now() - chrono::Duration::minutes(5);
    let newer = Operation::new("op2".to_string(), app_id.clone(), OperationKind::Start);
    db.insert_operation(older).await.unwrap();
    db.insert_operation(newer).await.unwrap();

    let rows = db.list_operations_for_app(app_id.as_str(), 10).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, "op2");
    assert_eq!(rows[1].id, "op1");
  }
}
