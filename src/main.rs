//! Daemon binary: loads settings, connects the fleet, replays any
//! lockfiles, then serves the actor until interrupted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use archond::config::Settings;
use archond::controller::ArchonController;
use archond::core::{
    NullSensorReader, Reporter, SystemClock, TracingReplySink,
};
use archond::daemon::{ArchonDaemon, COMMAND_QUEUE};
use archond::error::ArchonError;
use archond::exposure::{ExposureDelegate, FileCounterStore};
use archond::messages::DaemonCommand;
use archond::storage::FitsFileWriter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run().await {
        error!("{err:#}");
        let code = err
            .downcast_ref::<ArchonError>()
            .map(ArchonError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn config_path() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ARCHOND_CONFIG").ok())
        .map(PathBuf::from)
}

async fn run() -> Result<()> {
    let path = config_path();
    let settings = Arc::new(
        Settings::new(path.as_deref()).context("loading settings")?,
    );
    info!(
        controllers = settings.controllers.len(),
        observatory = %settings.observatory,
        "archond {} starting",
        env!("CARGO_PKG_VERSION")
    );

    let reporter = Reporter::new(Arc::new(TracingReplySink));

    let mut controllers = HashMap::new();
    for (name, descriptor) in &settings.controllers {
        if !descriptor.enabled {
            info!(controller = %name, "disabled, skipping");
            continue;
        }
        let device = Arc::new(ArchonController::new(
            name,
            descriptor.clone(),
            settings.timeouts.clone(),
        ));
        match device.connect().await {
            Ok(()) => info!(controller = %name, "controller ready"),
            Err(err) => {
                // Come up degraded; an explicit reconnect can retry later.
                warn!(controller = %name, %err, "could not connect");
            }
        }
        controllers.insert(name.clone(), device);
    }

    let counter = FileCounterStore::in_user_state_dir().context("locating exposure counter")?;
    let delegate = Arc::new(ExposureDelegate::new(
        Arc::clone(&settings),
        controllers,
        reporter.clone(),
        Arc::new(FitsFileWriter),
        Arc::new(NullSensorReader),
        Arc::new(SystemClock),
        Arc::new(counter),
    ));

    // Replay exposures orphaned by a previous crash.
    match delegate.recover().await {
        Ok(recovered) if !recovered.is_empty() => {
            info!(count = recovered.len(), "recovered orphaned exposures");
        }
        Ok(_) => {}
        Err(err) => warn!(%err, "startup recovery failed"),
    }

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let daemon = ArchonDaemon::new(Arc::clone(&delegate), reporter);
    let actor = tokio::spawn(daemon.run(command_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupt received, shutting down");

    let (shutdown, done) = DaemonCommand::shutdown();
    if command_tx.send(shutdown).await.is_ok() {
        let _ = done.await;
    }
    actor.await.context("daemon actor panicked")?;
    Ok(())
}
