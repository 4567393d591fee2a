#![deny(unsafe_code)]
use agent_daemon::{build_app, AppState};
use agent_engine::Engine;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agent-daemon", version, about = "GPU render job agent daemon")]
struct Args {
    /// Bind address for the dispatch HTTP surface.
    #[arg(long, default_value = "127.0.0.1:8088")]
    bind: String,

    /// Path to the agent's TOML configuration file.
    #[arg(long, default_value = "agent.toml")]
    config: PathBuf,

    /// Enable verbose request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("agent=debug,agent_engine=debug,agent_daemon=info")
    } else {
        EnvFilter::new("agent=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = agent_config::load_config(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;
    for warning in agent_config::validate_config(&config).context("validate config")? {
        tracing::warn!(%warning, "configuration warning");
    }
    config.ensure_directories().context("create configured directories")?;

    let engine = Engine::new(config).context("build engine")?;
    let state = Arc::new(AppState { engine: Arc::new(engine) });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "agent-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
