//! healthcheck server binary.
//!
//! Reads `config.toml` (or the path specified with `--config`) layered with
//! `HEALTHCHECK_*` environment variables, opens the SQLite store, starts the
//! periodic sync jobs and serves the JSON API over HTTP.
//!
//! # Password hash generation
//!
//! To generate the argon2 PHC string for a `[[users]]` entry:
//!
//! ```
//! cargo run -p healthcheck-server --bin server -- --hash-password
//! ```
//!
//! # One-off sync
//!
//! ```
//! cargo run -p healthcheck-server --bin server -- --run-sync warehouse
//! ```

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use clap::Parser;
use healthcheck_core::{service::HealthService, validate::Validator};
use healthcheck_server::{
  AppState, ServerConfig,
  auth::{self, UserTable},
  scheduler,
};
use healthcheck_store_sqlite::SqliteStore;
use healthcheck_sync::Dispatcher;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Health-check ingestion and sync server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  /// Print the argon2 hash for a password entered on stdin and exit.
  #[arg(long)]
  hash_password: bool,

  /// Run one pass of the named sync job, print its outcome and exit.
  #[arg(long, value_name = "JOB")]
  run_sync: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Helper mode: hash a password and exit.
  if cli.hash_password {
    let password = read_password()?;
    let hash = auth::hash_password(&password).map_err(|e| anyhow::anyhow!("argon2 error: {e}"))?;
    println!("{hash}");
    return Ok(());
  }

  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("HEALTHCHECK").separator("__"))
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  let store_path = expand_tilde(&server_cfg.store_path);
  if let Some(parent) = store_path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {parent:?}"))?;
  }
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;
  let store = Arc::new(store);

  let dispatcher = Dispatcher::from_config(Arc::clone(&store), &server_cfg.sync)
    .context("invalid sync configuration")?;

  // One-shot mode: run a single sync pass and exit.
  if let Some(job) = cli.run_sync {
    let outcome = dispatcher
      .run_sync(&job)
      .await
      .with_context(|| format!("sync job {job} failed"))?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    return Ok(());
  }

  let validator = Validator::new(&server_cfg.default_region)
    .with_context(|| format!("invalid default_region {:?}", server_cfg.default_region))?;
  if server_cfg.users.is_empty() {
    tracing::warn!("no users configured; every authenticated route will return 401");
  }

  let _jobs = scheduler::spawn(&dispatcher, &server_cfg.sync.interval_secs);

  let state = AppState {
    service: HealthService::new(Arc::clone(&store), validator, server_cfg.tb_study.clone()),
    dispatcher,
    users: Arc::new(UserTable::new(&server_cfg.users)),
  };

  let app = healthcheck_server::router(state);
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app).await.context("server error")?;

  Ok(())
}

/// Read a password from stdin.
fn read_password() -> anyhow::Result<String> {
  use std::io::{self, BufRead, Write};
  print!("Password: ");
  io::stdout().flush().ok();
  let mut line = String::new();
  io::stdin().lock().read_line(&mut line)?;
  Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
