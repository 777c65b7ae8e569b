use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use coordinator::records::{MemoryTaskRecords, PgTaskRecords, TaskRecords};
use coordinator::storage::{MemoryStorage, PgStorage, Storage};
use coordinator::token::TokenIssuer;
use coordinator::{handlers, monitor, AppState, Config, Coordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coordinator=debug,tower_http=info")),
        )
        .init();

    let config = Config::from_env().context("configuración inválida")?;

    let (storage, records): (Arc<dyn Storage>, Arc<dyn TaskRecords>) = match &config.database_url
    {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("no se pudo conectar a Postgres")?;
            let storage: Arc<dyn Storage> = Arc::new(PgStorage::connect(pool.clone()).await?);
            let records: Arc<dyn TaskRecords> = Arc::new(PgTaskRecords::new(pool));
            (storage, records)
        }
        None => {
            warn!("DATABASE_URL no definida: cola y registros solo en memoria");
            let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
            let records: Arc<dyn TaskRecords> = Arc::new(MemoryTaskRecords::new());
            (storage, records)
        }
    };

    let tokens = TokenIssuer::new(config.jwt_private_key.clone(), config.coordinator.token_ttl);
    let cleanup_interval = config.coordinator.cleanup_interval;

    let coordinator = Coordinator::load(
        config.coordinator.clone(),
        config.urls.clone(),
        storage,
        records.clone(),
        tokens,
    )
    .await
    .context("no se pudo cargar la cola guardada")?;
    let handle = coordinator.spawn();

    // tick periódico para la limpieza de listeners
    tokio::spawn(monitor::run_monitor(handle.clone(), cleanup_interval));

    let state = AppState::new(handle, records, config.worker_secret.clone(), config.urls);
    let app = handlers::build_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("coordinador escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
