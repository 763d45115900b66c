//! cinerenderd: render worker daemon.
//!
//! Usage: `cinerenderd [PORT]`. Serves one job per connection with the
//! pass-through encoder until the process is stopped.

use std::sync::Arc;

use anyhow::{Context, Result};

use cinerender_core::config::CineRenderConfig;
use cinerender_net::{PassthroughEncoder, WorkerServer};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    match CineRenderConfig::file_path() {
        Some(path) => match CineRenderConfig::write_default_to(&path) {
            Ok(true) => tracing::info!(path = %path.display(), "wrote default config"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "failed to write default config"),
        },
        None => tracing::info!("no config home set, using defaults and environment"),
    }
    let mut config = CineRenderConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CineRenderConfig::default()
    });

    if let Some(arg) = std::env::args().nth(1) {
        config.network.port = arg
            .parse()
            .with_context(|| format!("invalid port {arg:?}"))?;
    }
    tracing::info!(
        endpoint = %config.network.listen_endpoint(),
        io_timeout_secs = config.network.io_timeout_secs,
        max_connections = config.worker.connection_limit(),
        "cinerenderd starting"
    );

    let server = WorkerServer::bind(&config, Arc::new(PassthroughEncoder))?;
    server.run()
}
