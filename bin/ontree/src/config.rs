//! Process-wide configuration: CLI flags → environment variables →
//! config file → defaults (spec §4.L). Resolved once per process into a
//! `OnceLock`, the same pattern the teacher uses for its agent config.

use std::path::PathBuf;
use std::sync::OnceLock;

use clap::Parser;
use colored::Colorize;
use ontree_config::{ConfigLoader, LogConfig, LogLevel, StdioLogMode};
use serde::Deserialize;

/// Flags accepted by every `ontree` subcommand, parsed once at startup.
/// Subcommand-specific flags live on the command enum in `cli.rs`.
#[derive(Parser, Debug, Clone, Default)]
pub struct CliArgs {
  /// Config file path(s) to load, merged in order.
  #[arg(long, global = true)]
  pub config_path: Option<Vec<String>>,

  #[arg(long, global = true)]
  pub log_level: Option<tracing::Level>,

  /// Emit one JSON object per event instead of human-readable text.
  #[arg(long, global = true)]
  pub json: bool,

  #[command(subcommand)]
  pub command: crate::cli::Command,
}

#[derive(Deserialize, Debug, Default)]
pub struct Env {
  pub ontree_config_paths: Vec<String>,
  #[serde(default)]
  pub ontree_config_keywords: Vec<String>,
  pub database_path: Option<PathBuf>,
  pub ontree_apps_dir: Option<PathBuf>,
  pub listen_addr: Option<String>,
  pub port: Option<u16>,
  pub auth_username: Option<String>,
  pub auth_password: Option<String>,
  pub session_key: Option<String>,
  pub monitoring_enabled: Option<bool>,
  pub public_base_domain: Option<String>,
  pub tailscale_base_domain: Option<String>,
  pub caddy_admin_url: Option<String>,
  pub treeos_run_mode: Option<String>,
  pub treeos_openwebui_admin_email: Option<String>,
  pub treeos_openwebui_admin_password: Option<String>,
  pub treeos_openwebui_admin_name: Option<String>,
  pub ontree_logging_level: Option<LogLevel>,
  pub ontree_logging_stdio: Option<StdioLogMode>,
  pub ontree_logging_pretty: Option<bool>,
}

/// Fully resolved engine configuration (spec §3 `AppRecord`/§4.L/§6 env
/// vars), after merging flags, env and file with defaults applied.
#[derive(Debug, Clone)]
pub struct OnTreeConfig {
  pub database_path: PathBuf,
  pub apps_dir: PathBuf,
  pub shared_root: PathBuf,
  pub templates_dir: PathBuf,
  pub listen_addr: String,
  pub port: u16,
  pub auth_username: Option<String>,
  pub auth_password: Option<String>,
  pub session_key: Option<String>,
  pub monitoring_enabled: bool,
  pub monitoring_interval_secs: u64,
  pub monitoring_retention_days: u32,
  pub public_base_domain: Option<String>,
  pub tailscale_base_domain: Option<String>,
  pub caddy_admin_url: String,
  pub demo_mode: bool,
  pub openwebui_admin_email: Option<String>,
  pub openwebui_admin_password: Option<String>,
  pub openwebui_admin_name: Option<String>,
  pub logging: LogConfig,
}

impl Default for OnTreeConfig {
  fn default() -> Self {
    Self {
      database_path: PathBuf::from("ontree.db"),
      apps_dir: PathBuf::from("apps"),
      shared_root: PathBuf::from("shared"),
      templates_dir: PathBuf::from("templates"),
      listen_addr: "0.0.0.0".to_string(),
      port: 8120,
      auth_username: None,
      auth_password: None,
      session_key: None,
      monitoring_enabled: true,
      monitoring_interval_secs: 60,
      monitoring_retention_days: 7,
      public_base_domain: None,
      tailscale_base_domain: None,
      caddy_admin_url: "http://localhost:2019".to_string(),
      demo_mode: false,
      openwebui_admin_email: None,
      openwebui_admin_password: None,
      openwebui_admin_name: None,
      logging: LogConfig::default(),
    }
  }
}

pub fn ontree_config() -> &'static OnTreeConfig {
  static ONTREE_CONFIG: OnceLock<OnTreeConfig> = OnceLock::new();
  ONTREE_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env().unwrap_or_default();
    let args = cli_args();
    let config_paths = args.config_path.clone().unwrap_or_else(|| {
      env.ontree_config_paths.clone()
    });

    let defaults = OnTreeConfig::default();
    let file_config = if config_paths.is_empty() {
      println!("{}: no config paths given, using defaults", "INFO".green());
      defaults.clone()
    } else {
      let loader = ConfigLoader {
        paths: &config_paths.iter().map(|p| std::path::Path::new(p.as_str())).collect::<Vec<_>>(),
        match_wildcards: &env
          .ontree_config_keywords
          .iter()
          .map(String::as_str)
          .collect::<Vec<_>>(),
        include_file_name: ".ontreeinclude",
        merge_nested: true,
        extend_array: false,
        debug_print: args.log_level == Some(tracing::Level::DEBUG),
      };
      match loader.load::<PartialOnTreeConfig>() {
        Ok(partial) => partial.into_config(defaults),
        Err(err) => {
          eprintln!("{}: failed to load config files: {err:#}", "WARN".yellow());
          defaults.clone()
        }
      }
    };

    OnTreeConfig {
      database_path: env.database_path.unwrap_or(file_config.database_path),
      apps_dir: env.ontree_apps_dir.unwrap_or(file_config.apps_dir),
      listen_addr: env.listen_addr.unwrap_or(file_config.listen_addr),
      port: env.port.unwrap_or(file_config.port),
      auth_username: env.auth_username.or(file_config.auth_username),
      auth_password: env.auth_password.or(file_config.auth_password),
      session_key: env.session_key.or(file_config.session_key),
      monitoring_enabled: env.monitoring_enabled.unwrap_or(file_config.monitoring_enabled),
      public_base_domain: env.public_base_domain.or(file_config.public_base_domain),
      tailscale_base_domain: env.tailscale_base_domain.or(file_config.tailscale_base_domain),
      caddy_admin_url: env.caddy_admin_url.unwrap_or(file_config.caddy_admin_url),
      demo_mode: env.treeos_run_mode.as_deref().map(|mode| mode.eq_ignore_ascii_case("demo")).unwrap_or(file_config.demo_mode),
      openwebui_admin_email: env.treeos_openwebui_admin_email.or(file_config.openwebui_admin_email),
      openwebui_admin_password: env.treeos_openwebui_admin_password.or(file_config.openwebui_admin_password),
      openwebui_admin_name: env.treeos_openwebui_admin_name.or(file_config.openwebui_admin_name),
      logging: LogConfig {
        level: args.log_level.map(LogLevel::from).or(env.ontree_logging_level).unwrap_or(file_config.logging.level),
        stdio: env.ontree_logging_stdio.unwrap_or(file_config.logging.stdio),
        pretty: env.ontree_logging_pretty.unwrap_or(file_config.logging.pretty),
        location: file_config.logging.location,
      },
      ..file_config
    }
  })
}

/// Mirrors `OnTreeConfig` with every field optional, the shape a config
/// file is deserialized into before merging over defaults.
#[derive(Deserialize, Debug, Default)]
struct PartialOnTreeConfig {
  database_path: Option<PathBuf>,
  apps_dir: Option<PathBuf>,
  shared_root: Option<PathBuf>,
  templates_dir: Option<PathBuf>,
  listen_addr: Option<String>,
  port: Option<u16>,
  auth_username: Option<String>,
  auth_password: Option<String>,
  session_key: Option<String>,
  monitoring_enabled: Option<bool>,
  monitoring_interval_secs: Option<u64>,
  monitoring_retention_days: Option<u32>,
  public_base_domain: Option<String>,
  tailscale_base_domain: Option<String>,
  caddy_admin_url: Option<String>,
  demo_mode: Option<bool>,
  openwebui_admin_email: Option<String>,
  openwebui_admin_password: Option<String>,
  openwebui_admin_name: Option<String>,
  #[serde(default)]
  logging: PartialLogConfig,
}

#[derive(Deserialize, Debug, Default)]
struct PartialLogConfig {
  level: Option<LogLevel>,
  stdio: Option<StdioLogMode>,
  pretty: Option<bool>,
  location: Option<bool>,
}

impl PartialOnTreeConfig {
  fn into_config(self, defaults: OnTreeConfig) -> OnTreeConfig {
    OnTreeConfig {
      database_path: self.database_path.unwrap_or(defaults.database_path),
      apps_dir: self.apps_dir.unwrap_or(defaults.apps_dir),
      shared_root: self.shared_root.unwrap_or(defaults.shared_root),
      templates_dir: self.templates_dir.unwrap_or(defaults.templates_dir),
      listen_addr: self.listen_addr.unwrap_or(defaults.listen_addr),
      port: self.port.unwrap_or(defaults.port),
      auth_username: self.auth_username.or(defaults.auth_username),
      auth_password: self.auth_password.or(defaults.auth_password),
      session_key: self.session_key.or(defaults.session_key),
      monitoring_enabled: self.monitoring_enabled.unwrap_or(defaults.monitoring_enabled),
      monitoring_interval_secs: self.monitoring_interval_secs.unwrap_or(defaults.monitoring_interval_secs),
      monitoring_retention_days: self.monitoring_retention_days.unwrap_or(defaults.monitoring_retention_days),
      public_base_domain: self.public_base_domain.or(defaults.public_base_domain),
      tailscale_base_domain: self.tailscale_base_domain.or(defaults.tailscale_base_domain),
      caddy_admin_url: self.caddy_admin_url.unwrap_or(defaults.caddy_admin_url),
      demo_mode: self.demo_mode.unwrap_or(defaults.demo_mode),
      openwebui_admin_email: self.openwebui_admin_email.or(defaults.openwebui_admin_email),
      openwebui_admin_password: self.openwebui_admin_password.or(defaults.openwebui_admin_password),
      openwebui_admin_name: self.openwebui_admin_name.or(defaults.openwebui_admin_name),
      logging: LogConfig {
        level: self.logging.level.unwrap_or(defaults.logging.level),
        stdio: self.logging.stdio.unwrap_or(defaults.logging.stdio),
        pretty: self.logging.pretty.unwrap_or(defaults.logging.pretty),
        location: self.logging.location.unwrap_or(defaults.logging.location),
      },
    }
  }
}

/// A `serde`-friendly view of [`OnTreeConfig`] with every secret-bearing
/// field replaced by a fixed placeholder, for `ontree config show` (spec
/// §6 `--json` introspection; mirrors the teacher's own config dump
/// commands, which never echo secrets back to a terminal).
#[derive(Debug, serde::Serialize)]
pub struct RedactedConfig<'a> {
  pub database_path: &'a std::path::Path,
  pub apps_dir: &'a std::path::Path,
  pub listen_addr: &'a str,
  pub port: u16,
  pub auth_username: Option<&'a str>,
  pub auth_password: Option<&'static str>,
  pub session_key: Option<&'static str>,
  pub monitoring_enabled: bool,
  pub monitoring_interval_secs: u64,
  pub monitoring_retention_days: u32,
  pub public_base_domain: Option<&'a str>,
  pub tailscale_base_domain: Option<&'a str>,
  pub caddy_admin_url: &'a str,
  pub demo_mode: bool,
  pub openwebui_admin_email: Option<&'static str>,
  pub openwebui_admin_password: Option<&'static str>,
  pub openwebui_admin_name: Option<&'static str>,
}

const REDACTED: &str = "<redacted>";

pub fn redacted(config: &OnTreeConfig) -> RedactedConfig<'_> {
  RedactedConfig {
    database_path: &config.database_path,
    apps_dir: &config.apps_dir,
    listen_addr: &config.listen_addr,
    port: config.port,
    auth_username: config.auth_username.as_deref(),
    auth_password: config.auth_password.as_ref().map(|_| REDACTED),
    session_key: config.session_key.as_ref().map(|_| REDACTED),
    monitoring_enabled: config.monitoring_enabled,
    monitoring_interval_secs: config.monitoring_interval_secs,
    monitoring_retention_days: config.monitoring_retention_days,
    public_base_domain: config.public_base_domain.as_deref(),
    tailscale_base_domain: config.tailscale_base_domain.as_deref(),
    caddy_admin_url: &config.caddy_admin_url,
    demo_mode: config.demo_mode,
    openwebui_admin_email: config.openwebui_admin_email.as_ref().map(|_| REDACTED),
    openwebui_admin_password: config.openwebui_admin_password.as_ref().map(|_| REDACTED),
    openwebui_admin_name: config.openwebui_admin_name.as_ref().map(|_| REDACTED),
  }
}

pub fn cli_args() -> &'static CliArgs {
  static CLI_ARGS: OnceLock<CliArgs> = OnceLock::new();
  CLI_ARGS.get_or_init(CliArgs::parse)
}
