//! tidbit
//!
//! A self-hosted personal wiki server speaking the TiddlyWeb protocol.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tidbit_core::{BackendRegistry, Config};

mod http;
mod state;

use http::HttpServer;
use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "tidbit")]
#[command(about = "tidbit - a self-hosted personal wiki")]
#[command(version)]
struct Cli {
    /// HTTP service address
    #[arg(long = "http", value_name = "ADDR")]
    http_addr: Option<String>,

    /// Optional password to protect the wiki
    #[arg(short, long)]
    password: Option<String>,

    /// Storage backend (redb, sqlite, flatfile)
    #[arg(long)]
    backend: Option<String>,

    /// Database file, or store directory for the flatfile backend
    #[arg(long = "db", value_name = "PATH")]
    data_source: Option<PathBuf>,

    /// Path to the config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Page served at /
    #[arg(long = "index", value_name = "PATH")]
    index_path: Option<PathBuf>,
}

impl Cli {
    /// Flags override everything loaded from file and environment
    fn apply(self, config: &mut Config) {
        if let Some(addr) = self.http_addr {
            config.http_addr = addr;
        }
        if let Some(password) = self.password {
            config.password = (!password.is_empty()).then_some(password);
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(source) = self.data_source {
            config.data_source = Some(source);
        }
        if let Some(index) = self.index_path {
            config.index_path = Some(index);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    cli.apply(&mut config);

    init_logging(&config.log_level);

    if config.data_source.is_none() {
        config.ensure_data_dir()?;
    }

    let registry = BackendRegistry::builtin();
    let store = registry.open(&config.backend, &config.data_source_path())?;

    let mut state = AppState::new(store, index_path(config.index_path.clone()));
    if let Some(password) = &config.password {
        state = state.with_credentials(&config.username, password);
        info!(username = %config.username, "password protection enabled");
    }

    let server = HttpServer::spawn(&config.http_addr, state).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await
}

/// Install the fmt subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tidbit_core={level},tidbit={level},tower_http={level}"
        ))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

/// Where to look for the index page when none is configured: next to the
/// executable, falling back to the working directory.
fn index_path(configured: Option<PathBuf>) -> PathBuf {
    if let Some(path) = configured {
        return path;
    }

    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("index.html")));
    match beside_exe {
        Some(path) if path.is_file() => path,
        _ => std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("index.html"),
    }
}
