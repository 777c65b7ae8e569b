use std::time::Duration;

use tracing::{debug, info};

use crate::actor::CoordinatorHandle;

/// Despierta al coordinador cada `interval` para que la limpieza de
/// listeners corra aunque no haya tráfico.
pub async fn run_monitor(handle: CoordinatorHandle, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        debug!("tick del monitor");
        if handle.tick().await.is_err() {
            info!("el coordinador terminó, se detiene el monitor");
            break;
        }
    }
}
