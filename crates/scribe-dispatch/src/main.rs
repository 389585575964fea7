use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use scribe_core::config::Config;
use scribe_dispatch::admission::spawn_worker_count_scraper;
use scribe_dispatch::engine::Dispatcher;
use scribe_dispatch::watch::DirWatcher;

#[derive(Debug, Parser)]
#[command(name = "scribe-dispatch", version, about = "STT ingest dispatcher")]
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
    let Some(input_path) = cfg.inotify.input_path.clone() else {
        anyhow::bail!("not set inotify.input_path");
    };
    std::fs::create_dir_all(&input_path)?;

    let dispatcher = Dispatcher::new(cfg.clone())?;

    // The ceiling either comes from configuration or tracks the broker's
    // registered vr_stt workers.
    if cfg.inotify.maximum_jobs.is_none() {
        if let Some(admin_port) = cfg.master.admin_port {
            spawn_worker_count_scraper(
                dispatcher.admission().clone(),
                cfg.master.host.clone(),
                admin_port,
                "vr_stt".into(),
            );
        }
    }

    let (watcher, events) = DirWatcher::spawn(&input_path, &cfg.inotify.watch)?;
    tracing::info!(
        path = %input_path.display(),
        watch = %cfg.inotify.watch,
        "dispatcher running"
    );

    let run = tokio::spawn(dispatcher.run(events));

    tokio::signal::ctrl_c().await?;
    tracing::info!("stop requested, finishing in-flight records");
    drop(watcher); // closes the event channel; run() drains and returns
    run.await?;
    Ok(())
}
