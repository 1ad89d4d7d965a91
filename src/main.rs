//! oakcam: depth-camera to virtual webcam bridge with live sensor controls

use std::sync::Arc;

use color_eyre::Result;
use tracing::info;

use oakcam::state::SharedState;
use oakcam::supervisor::{Supervisor, V4l2Factory};
use oakcam::{panel, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging; the panel owns the terminal,
    // so logs go to a file
    color_eyre::install()?;
    let log = std::fs::File::create("oakcam.log")?;
    tracing_subscriber::fmt()
        .with_env_filter("oakcam=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::sync::Mutex::new(log))
        .with_ansi(false)
        .init();

    info!("oakcam launching...");

    // Load configuration
    let config = Config::load(std::env::args().nth(1).as_deref())?;
    oakcam::CONFIG.store(Arc::new(config.clone()));

    let state = Arc::new(SharedState::new());
    let (requests_tx, requests_rx) = flume::unbounded();
    let (status_tx, status_rx) = flume::unbounded();

    let supervisor = Supervisor::new(config, V4l2Factory, Arc::clone(&state), requests_rx, status_tx);
    let supervisor_task = tokio::spawn(supervisor.run());

    // The panel is blocking terminal I/O; keep it off the async threads.
    // Its exit sends Shutdown, which disconnects before we leave.
    tokio::task::spawn_blocking(move || panel::run(requests_tx, status_rx)).await??;

    supervisor_task.await?;
    info!("oakcam shutting down");
    Ok(())
}
