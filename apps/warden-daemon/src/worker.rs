//! Entry point of the administrative API worker, spawned as a child
//! process of the daemon. It opens its own catalog connection and joins
//! the state synchronizer as a client; with `skip_retry` it degrades to
//! read-only work whenever the owning daemon is unreachable. The HTTP
//! surface itself mounts on top of these handles and ships separately.

use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info};

use warden_db::{Catalog, CatalogConfig};

use crate::config::Config;
use crate::state::StateHandle;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = StateHandle::new(config.state_socket_path(), config.api.key.clone());
    state
        .connect(Duration::from_secs(3), true)
        .await
        .context("failed to reach the state synchronizer")?;

    let catalog = Catalog::open(CatalogConfig {
        path: Some(config.database.path.clone()),
        temp_path: config.main.temp_path.clone(),
        max_users: config.main.max_users,
        max_active_users: config.main.max_active_users,
        // Backups belong to the owning daemon.
        backup_interval: 0,
    })
    .await
    .context("failed to open the catalog")?;

    info!(
        "the api worker is started (synchronizer {})",
        if state.connected() { "connected" } else { "unreachable" }
    );
    if let Some(fallback) = &config.main.nginx_fallback_socket_path {
        debug!(
            "unauthenticated requests fall back to '{}'",
            fallback.display()
        );
    }

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to install SIGINT")?;
    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }

    catalog.close().await;
    info!("the api worker is stopped");
    Ok(())
}
