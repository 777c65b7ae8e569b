mod worker;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::worker::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,reqwest=info")),
        )
        .init();

    // Nombre de host (solo para info)
    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let cfg = WorkerConfig::from_env()?;
    info!(
        "worker en {} usando {} (concurrency={})",
        hostname, cfg.pipeline_cmd, cfg.concurrency
    );

    worker::run(cfg).await
}
