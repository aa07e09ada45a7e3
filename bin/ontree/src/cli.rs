//! CLI command surface (spec §6). Defines the subcommand shape only;
//! `main.rs` owns parsing entry and dispatch.

use std::path::PathBuf;
use std::time::Duration;

use clap::Subcommand;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
  /// First-run bootstrap: admin user and node identity.
  #[command(subcommand)]
  Setup(SetupCommand),
  /// App lifecycle: install, start/stop, recreate, delete, health,
  /// expose/unexpose, image updates.
  #[command(subcommand)]
  App(AppCommand),
  /// Inference model management inside the labelled inference container.
  #[command(subcommand)]
  Model(ModelCommand),
  /// Runs the HTTP server consuming the same engine.
  Serve,
  /// Prints the resolved configuration, secrets redacted.
  #[command(subcommand)]
  Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
  Show,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SetupCommand {
  Init {
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    #[arg(long, default_value = "TreeOS")]
    node_name: String,
    #[arg(long, default_value = "tree")]
    node_icon: String,
  },
  Status,
}

#[derive(Subcommand, Debug, Clone)]
pub enum AppCommand {
  List,
  Install {
    app: String,
    #[arg(long)]
    version: Option<String>,
    /// Path to a `.env`-style file whose keys are merged into the
    /// scaffolded app's `.env` (spec §6 `app install`).
    #[arg(long)]
    env: Option<PathBuf>,
  },
  Start {
    app: String,
  },
  Stop {
    app: String,
  },
  Recreate {
    app: String,
  },
  Delete {
    app: String,
  },
  Health {
    app: String,
    #[arg(long)]
    http: Option<String>,
    #[arg(long, value_parser = parse_duration, default_value = "180s")]
    timeout: Duration,
    #[arg(long, value_parser = parse_duration, default_value = "3s")]
    interval: Duration,
  },
  Expose {
    app: String,
    #[arg(long)]
    subdomain: String,
  },
  Unexpose {
    app: String,
  },
  UpdateImage {
    app: String,
  },
  Logs {
    app: String,
    #[arg(long)]
    service: Vec<String>,
    #[arg(long)]
    follow: bool,
    #[arg(long)]
    tail: Option<u32>,
  },
  History {
    app: String,
  },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ModelCommand {
  List,
  Install {
    name: String,
  },
  Health {
    name: String,
    #[arg(long, value_parser = parse_duration, default_value = "180s")]
    timeout: Duration,
    #[arg(long, value_parser = parse_duration, default_value = "3s")]
    interval: Duration,
  },
}

/// Accepts a bare integer (seconds) or a `<n>s` suffix — enough for the
/// `--timeout`/`--interval` flags documented in spec §6.
fn parse_duration(raw: &str) -> Result<Duration, String> {
  let digits = raw.strip_suffix('s').unwrap_or(raw);
  digits.parse::<u64>().map(Duration::from_secs).map_err(|_| format!("invalid duration: {raw}"))
}

/// Reads a `.env`-style file (`KEY=VALUE` lines, `#` comments, blank
/// lines ignored) for the `app install --env` flag.
pub fn read_env_file(path: &std::path::Path) -> std::io::Result<Vec<(String, String)>> {
  let content = std::fs::read_to_string(path)?;
  Ok(
    content
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty() && !line.starts_with('#'))
      .filter_map(|line| line.split_once('='))
      .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_duration_accepts_seconds_suffix() {
    assert_eq!(parse_duration("180s").unwrap(), Duration::from_secs(180));
  }

  #[test]
  fn parse_duration_accepts_bare_integer() {
    assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
  }

  #[test]
  fn parse_duration_rejects_garbage() {
    assert!(parse_duration("soon").is_err());
  }

  #[test]
  fn read_env_file_skips_comments_and_blanks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".env");
    std::fs::write(&path, "# comment\n\nFOO=bar\nBAZ=qux\n").unwrap();
    let parsed = read_env_file(&path).unwrap();
    assert_eq!(parsed, vec![("FOO".to_string(), "bar".to_string()), ("BAZ".to_string(), "qux".to_string())]);
  }
}
