//! Core bootstrap (spec §4.L): initial-setup state and the first admin
//! user. Config precedence and env var handling live in `config.rs`;
//! this module only owns the one-time `setup init` transaction.

pub mod db;

use bcrypt::{DEFAULT_COST, hash};
use ontree_entities::{EngineError, SetupState, User};

pub use db::Db;

pub async fn setup_status(db: &Db) -> Result<SetupState, EngineError> {
  db.get_setup_state().await
}

/// Creates the first user and marks setup complete, atomically. Fails
/// with `setup_already_completed` on a second call (spec §4.L, §6
/// `setup init`).
pub async fn setup_init(
  db: &Db,
  username: String,
  password: String,
  node_name: String,
  node_icon: String,
) -> Result<(), EngineError> {
  let password_hash =
    hash(password, DEFAULT_COST).map_err(|e| EngineError::ComposeError(format!("password hash: {e}")))?;
  let user = User {
    username,
    password_hash,
    is_staff: true,
    is_superuser: true,
    date_joined: chrono::Utc::now(),
  };
  db.complete_setup(user, node_name, node_icon).await
}
