use serde::{Deserialize, Serialize};

/// Singleton bootstrap state (spec §3, §4.L). Created empty, mutated
/// exactly once by `setup init`, never deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetupState {
  pub complete: bool,
  pub node_name: String,
  pub node_icon: String,
}

/// A local user account (spec §3). The first user created is both staff
/// and superuser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
  pub username: String,
  /// Salted adaptive-KDF hash (bcrypt), never the plaintext password.
  pub password_hash: String,
  pub is_staff: bool,
  pub is_superuser: bool,
  pub date_joined: chrono::DateTime<chrono::Utc>,
}
