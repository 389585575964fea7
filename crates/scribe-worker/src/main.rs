use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use scribe_broker::WorkerRuntime;
use scribe_core::config::Config;
use scribe_worker::control::{self, ControlState};
use scribe_worker::handlers::{self, WorkerContext};

#[derive(Debug, Parser)]
#[command(name = "scribe-worker", version, about = "STT worker node")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "SCRIBE_CONFIG", default_value = "scribe.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Arc::new(Config::load(&cli.config)?);
    tracing::info!(server = %cfg.stt.server_name, "scribe worker initialize");

    let ctx = WorkerContext::new(cfg.clone())?;

    let control = control::router(ControlState {
        service: cfg.api.service.clone(),
        version: cfg.api.version.clone(),
    });
    let listener =
        tokio::net::TcpListener::bind(("0.0.0.0", cfg.api.port)).await?;
    tracing::info!(port = cfg.api.port, "control plane listening");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, control).await {
            tracing::error!(%err, "control plane stopped");
        }
    });

    tracing::info!(
        host = %cfg.master.host,
        port = cfg.master.port,
        "connect to master server"
    );
    let mut runtime = WorkerRuntime::new(cfg.master.host.clone(), cfg.master.port);
    handlers::register_all(&mut runtime, &ctx);
    tracing::info!("done");

    tokio::signal::ctrl_c().await?;
    tracing::info!("release server");
    runtime.shutdown();
    runtime.join().await;
    ctx.channels.close_all().await;
    Ok(())
}
