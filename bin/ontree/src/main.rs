//! `ontree`: the OnTree/TreeOS app lifecycle control plane. Wires config,
//! logging, the container runtime, the embedded store and the operation
//! engine together, then dispatches to either the CLI (spec §6) or the
//! HTTP `serve` surface.

mod bootstrap;
mod cli;
mod compose;
mod config;
mod engine;
mod inventory;
mod lifecycle;
mod models;
mod naming;
mod progress;
mod proxy;
mod runtime;
mod security;
mod serve;
mod vitals;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use ontree_entities::{ProgressEvent, ProgressEventKind};

use bootstrap::Db;
use cli::{AppCommand, Command, ModelCommand, SetupCommand};
use config::{cli_args, ontree_config};
use engine::{OperationEngine, OperationHandle};
use lifecycle::Lifecycle;
use models::ModelManager;
use proxy::ProxyReconciler;
use runtime::negotiate_runtime;

#[tokio::main]
async fn main() -> ExitCode {
  let config = ontree_config();
  if let Err(err) = ontree_logger::init(&config.logging) {
    eprintln!("{}: failed to initialise logging: {err:#}", "WARN".yellow());
  }

  let args = cli_args();
  let json = args.json;

  let db = match Db::open(&config.database_path) {
    Ok(db) => db,
    Err(err) => return fail(json, &err.to_string(), "db_open_failed"),
  };

  let runtime_kind = match negotiate_runtime().await {
    Ok(kind) => kind,
    Err(err) => return fail(json, &err.to_string(), err.code()),
  };

  let engine = OperationEngine::new(db.clone());
  if let Ok(swept) = engine.sweep_stale().await
    && swept > 0
  {
    tracing::info!(swept, "swept stale operations left by a prior crash");
  }
  let proxy = ProxyReconciler::new(config.caddy_admin_url.clone(), config.public_base_domain.clone(), config.tailscale_base_domain.clone());
  let lifecycle = Lifecycle::new(Arc::new(config.clone()), runtime_kind, engine.clone(), proxy.clone());
  let models = ModelManager::new(runtime_kind, engine.clone(), config.apps_dir.clone());

  match args.command.clone() {
    Command::Setup(SetupCommand::Init { username, password, node_name, node_icon }) => {
      match bootstrap::setup_init(&db, username, password, node_name, node_icon).await {
        Ok(()) => success_message(json, "setup complete"),
        Err(err) => fail(json, &err.to_string(), err.code()),
      }
    }
    Command::Setup(SetupCommand::Status) => match bootstrap::setup_status(&db).await {
      Ok(state) => {
        print_json_or(json, &state, || {
          println!(
            "setup: {}",
            if state.complete { "complete".green() } else { "pending".yellow() }
          )
        });
        ExitCode::SUCCESS
      }
      Err(err) => fail(json, &err.to_string(), err.code()),
    },

    Command::App(AppCommand::List) => {
      let adapter = runtime::RuntimeAdapter::new(runtime_kind);
      let apps = inventory::list_apps(&config.apps_dir, &adapter).await;
      print_json_or(json, &apps, || {
        for app in &apps {
          println!("{:<24} {:?}", app.dirname, app.status);
        }
      });
      ExitCode::SUCCESS
    }
    Command::App(AppCommand::Install { app, version, env }) => {
      let mut extra_env = Vec::new();
      if let Some(version) = version {
        extra_env.push(("APP_VERSION".to_string(), version));
      }
      if let Some(path) = env {
        match cli::read_env_file(&path) {
          Ok(kvs) => extra_env.extend(kvs),
          Err(err) => return fail(json, &err.to_string(), "env_read_failed"),
        }
      }
      apply_openwebui_admin_env(config, &mut extra_env);
      run_operation(json, lifecycle.install(app.clone(), app, extra_env).await).await
    }
    Command::App(AppCommand::Start { app }) => run_operation(json, lifecycle.start(app).await).await,
    Command::App(AppCommand::Stop { app }) => run_operation(json, lifecycle.stop(app).await).await,
    Command::App(AppCommand::Recreate { app }) => run_operation(json, lifecycle.recreate(app).await).await,
    Command::App(AppCommand::Delete { app }) => run_operation(json, lifecycle.delete(app).await).await,
    Command::App(AppCommand::UpdateImage { app }) => run_operation(json, lifecycle.update_image(app).await).await,
    Command::App(AppCommand::Health { app, http, timeout, interval }) => {
      run_operation(json, lifecycle.health(app, http, timeout, interval).await).await
    }
    Command::App(AppCommand::Expose { app, subdomain }) => {
      match lifecycle.expose(app.clone(), subdomain.clone()).await {
        Ok(()) => {
          let paths = ontree_entities::AppPaths::new(&config.apps_dir, &app);
          let host_port = compose::ComposeDocument::read(&paths.compose_path)
            .ok()
            .and_then(|d| d.get_metadata())
            .map(|m| m.host_port)
            .unwrap_or(0);
          if let Err(err) = proxy.add_or_update(&ontree_entities::AppIdentifier::derive(&app), &subdomain, host_port).await {
            return fail(json, &err.to_string(), err.code());
          }
          success_message(json, "app exposed")
        }
        Err(err) => fail(json, &err.to_string(), err.code()),
      }
    }
    Command::App(AppCommand::Logs { app, service, follow, tail }) => {
      let adapter = runtime::RuntimeAdapter::new(runtime_kind);
      let app_dir = config.apps_dir.join(&app);
      let cancel = tokio_util::sync::CancellationToken::new();
      let mut run = match adapter.logs(&app_dir, &service, follow, tail, cancel) {
        Ok(run) => run,
        Err(err) => return fail(json, &err.to_string(), err.code()),
      };
      while let Some(line) = run.lines.recv().await {
        match line.source {
          runtime::StreamSource::Stdout => println!("{}", line.text),
          runtime::StreamSource::Stderr => eprintln!("{}", line.text),
        }
      }
      match run.wait().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => fail(json, &err.to_string(), err.code()),
      }
    }
    Command::App(AppCommand::History { app }) => {
      let id = ontree_entities::AppIdentifier::derive(&app);
      match db.list_operations_for_app(id.as_str(), 50).await {
        Ok(ops) => {
          print_json_or(json, &ops, || {
            for op in &ops {
              println!("{:<36} {:<14} {:<12} {}", op.id, op.kind, format!("{:?}", op.state), op.started_at.to_rfc3339());
            }
          });
          ExitCode::SUCCESS
        }
        Err(err) => fail(json, &err.to_string(), err.code()),
      }
    }

    Command::App(AppCommand::Unexpose { app }) => match lifecycle.unexpose(app.clone()).await {
      Ok(()) => {
        proxy.remove(&ontree_entities::AppIdentifier::derive(&app)).await.ok();
        success_message(json, "app unexposed")
      }
      Err(err) => fail(json, &err.to_string(), err.code()),
    },

    Command::Model(ModelCommand::List) => match models.model_list().await {
      Ok(names) => {
        print_json_or(json, &names, || names.iter().for_each(|n| println!("{n}")));
        ExitCode::SUCCESS
      }
      Err(err) => fail(json, &err.to_string(), err.code()),
    },
    Command::Model(ModelCommand::Install { name }) => run_operation(json, models.model_install(name).await).await,
    Command::Model(ModelCommand::Health { name, timeout, interval }) => {
      run_operation(json, models.model_health(name, timeout, interval).await).await
    }

    Command::Config(cli::ConfigCommand::Show) => {
      print_json_or(json, &config::redacted(config), || println!("{:#?}", config::redacted(config)));
      ExitCode::SUCCESS
    }

    Command::Serve => {
      let background_cancel = tokio_util::sync::CancellationToken::new();
      if config.monitoring_enabled {
        let collector = vitals::VitalsCollector::new(db.clone(), config.monitoring_interval_secs, config.monitoring_retention_days);
        let cancel = background_cancel.clone();
        let apps_dir = config.apps_dir.clone();
        tokio::spawn(async move { collector.run(cancel, &apps_dir).await });
      }
      {
        let cancel = background_cancel.clone();
        let apps_dir = config.apps_dir.clone();
        let reconcile_interval = std::time::Duration::from_secs(30);
        tokio::spawn(async move { proxy.run(cancel, &apps_dir, runtime_kind, reconcile_interval).await });
      }
      let result = serve::run(&config.listen_addr, config.port, engine.clone()).await;
      background_cancel.cancel();
      match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => fail(json, &err.to_string(), "serve_failed"),
      }
    }
  }
}

async fn run_operation(json: bool, scheduled: Result<OperationHandle, ontree_entities::EngineError>) -> ExitCode {
  let mut handle = match scheduled {
    Ok(handle) => handle,
    Err(err) => return fail(json, &err.to_string(), err.code()),
  };
  let mut outcome = ExitCode::FAILURE;
  while let Some(event) = handle.events.recv().await {
    print_event(json, &event);
    if event.is_terminal() {
      outcome = if event.kind == ProgressEventKind::Success { ExitCode::SUCCESS } else { ExitCode::FAILURE };
    }
  }
  outcome
}

fn print_event(json: bool, event: &ProgressEvent) {
  if json {
    if let Ok(line) = serde_json::to_string(event) {
      println!("{line}");
    }
    return;
  }
  match event.kind {
    ProgressEventKind::Log => println!("{}", event.message),
    ProgressEventKind::Progress => match event.percent {
      Some(p) => println!("{} ({p}%)", event.message),
      None => println!("{}", event.message),
    },
    ProgressEventKind::Success => println!("{} {}", "OK".green().bold(), event.message),
    ProgressEventKind::Error => {
      let code = event.code.as_deref().unwrap_or("unknown");
      eprintln!("{} {} [{code}]", "ERROR".red().bold(), event.message);
    }
  }
}

fn success_message(json: bool, message: &str) -> ExitCode {
  print_event(json, &ProgressEvent::success(message));
  ExitCode::SUCCESS
}

fn fail(json: bool, message: &str, code: &str) -> ExitCode {
  print_event(json, &ProgressEvent::error(message, code));
  ExitCode::FAILURE
}

/// Translates `TREEOS_OPENWEBUI_ADMIN_{EMAIL,PASSWORD,NAME}`, whether
/// supplied via `--env` or process configuration (spec §6), into the
/// `WEBUI_ADMIN_*` keys OpenWebUI itself reads from `.env`. Values already
/// present in `extra_env` (i.e. given directly in the `--env` file) win
/// over the process-level defaults.
fn apply_openwebui_admin_env(config: &config::OnTreeConfig, extra_env: &mut Vec<(String, String)>) {
  const TRANSLATIONS: [(&str, &str); 3] =
    [("TREEOS_OPENWEBUI_ADMIN_EMAIL", "WEBUI_ADMIN_EMAIL"), ("TREEOS_OPENWEBUI_ADMIN_PASSWORD", "WEBUI_ADMIN_PASSWORD"), ("TREEOS_OPENWEBUI_ADMIN_NAME", "WEBUI_ADMIN_NAME")];
  for (treeos_key, webui_key) in TRANSLATIONS {
    if let Some(pos) = extra_env.iter().position(|(k, _)| k == treeos_key) {
      let (_, value) = extra_env.remove(pos);
      extra_env.push((webui_key.to_string(), value));
    }
  }
  if !extra_env.iter().any(|(k, _)| k == "WEBUI_ADMIN_EMAIL")
    && let Some(email) = &config.openwebui_admin_email
  {
    extra_env.push(("WEBUI_ADMIN_EMAIL".to_string(), email.clone()));
  }
  if !extra_env.iter().any(|(k, _)| k == "WEBUI_ADMIN_PASSWORD")
    && let Some(password) = &config.openwebui_admin_password
  {
    extra_env.push(("WEBUI_ADMIN_PASSWORD".to_string(), password.clone()));
  }
  if !extra_env.iter().any(|(k, _)| k == "WEBUI_ADMIN_NAME")
    && let Some(name) = &config.openwebui_admin_name
  {
    extra_env.push(("WEBUI_ADMIN_NAME".to_string(), name.clone()));
  }
}

fn print_json_or<T: serde::Serialize>(json: bool, value: &T, human: impl FnOnce()) {
  if json {
    if let Ok(line) = serde_json::to_string(value) {
      println!("{line}");
    }
  } else {
    human();
  }
}
