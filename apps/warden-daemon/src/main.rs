mod cli;
mod config;
mod lifecycle;
mod monitor;
mod reconciler;
mod services;
mod state;
mod worker;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden_db::{Catalog, CatalogConfig};

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::lifecycle::{Cleanup, InstanceLock};
use crate::monitor::Monitor;
use crate::reconciler::Reconciler;
use crate::state::{StateHandle, StateServer};

fn init_logging(level: &str, debug: bool) {
    let directives = if debug { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config.log.level, cli.debug);

    match cli.command {
        // Subcommands are clients of a possibly-running daemon; only the
        // daemon path takes the single-instance lock.
        Some(Command::Worker) => worker::run(config).await,
        Some(command) => {
            let code = cli::execute(command, &config).await;
            std::process::exit(code);
        }
        None => daemon(config).await,
    }
}

async fn daemon(config: Config) -> anyhow::Result<()> {
    let lock = InstanceLock::acquire(&config.lock_file_path())
        .context("failed to take the instance lock")?;
    info!("warden v{} is started", env!("CARGO_PKG_VERSION"));

    let cleanup = Arc::new(Cleanup::new());
    let signals = lifecycle::listen(Arc::clone(&cleanup));

    let state_server = StateServer::start(config.state_socket_path(), config.api.key.clone())
        .await
        .context("failed to start the state synchronizer server")?;

    let catalog = Catalog::open(CatalogConfig {
        path: Some(config.database.path.clone()),
        temp_path: config.main.temp_path.clone(),
        max_users: config.main.max_users,
        max_active_users: config.main.max_active_users,
        backup_interval: config.database.backup_interval.max(0) as u64,
    })
    .await
    .context("failed to open the catalog")?;

    // The data planes block on the user list at their own boot, so it is
    // generated before anything else is brought up.
    catalog.generate_list().await.context("failed to generate the user list")?;

    if config.api.enable {
        let executable = std::env::current_exe().context("failed to locate the executable")?;
        let child = tokio::process::Command::new(executable)
            .arg("worker")
            .spawn()
            .context("failed to spawn the api worker")?;
        cleanup.adopt(child);
    }

    let state = StateHandle::new(config.state_socket_path(), config.api.key.clone());
    state
        .connect(Duration::from_secs(3), false)
        .await
        .context("failed to connect to the state synchronizer")?;

    // Service adapters are constructed only after the worker subprocess
    // exists, so no transport ever spans a process boundary.
    let services = services::build(&config).context("failed to build the service adapters")?;
    let reconciler = Arc::new(Reconciler::new(catalog.clone(), services, state));
    reconciler
        .load_state()
        .await
        .context("failed to seed the reconciliation state")?;

    let monitor = Arc::new(Monitor::new(
        Arc::clone(&reconciler),
        Duration::from_secs(config.main.monitor_interval),
        config.main.monitor_passive_steps,
        config.main.monitor_zombies,
    )?);
    monitor.start()?;
    catalog.start_backup();

    {
        let monitor = Arc::clone(&monitor);
        cleanup.add_async(async move {
            monitor.stop(false).await;
        });
        let backups = catalog.clone();
        cleanup.add(move || backups.stop_backup());
        let catalog = catalog.clone();
        cleanup.add_async(async move {
            catalog.close().await;
        });
        cleanup.add(move || state_server.close());
        cleanup.add(move || lock.release());
    }

    // The signal listener owns process exit from here on.
    let _ = signals.await;
    Ok(())
}
