//! monagent: registry-driven monitoring command agent
//!
//! Serves `POST /execute` and friends over HTTP. The command registry is
//! reloaded when its file changes or on SIGHUP.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use monagent::backend::Backends;
use monagent::config::{self, LogFormat, LoggingConfig};
use monagent::{server, watcher, Engine, Registry};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;
    init_logging(&config.logging);

    info!("monagent {} starting...", env!("CARGO_PKG_VERSION"));
    match &config.source {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => warn!(
            "Config file not found at {}, using defaults",
            config::config_path().display()
        ),
    }

    let registry = Arc::new(
        Registry::from_path(&config.registry.path).with_context(|| {
            format!(
                "Failed to load command registry from {}",
                config.registry.path.display()
            )
        })?,
    );
    let backends =
        Backends::new(&config.backend_settings()).context("Failed to initialise backends")?;
    let engine = Arc::new(Engine::new(Arc::clone(&registry), backends));

    // Reload triggers: file watcher and SIGHUP feed one loop
    let cancel = CancellationToken::new();
    let (reload_tx, reload_rx) = mpsc::unbounded_channel();
    let _watcher = if config.registry.watch {
        watcher::start_file_watcher(&config.registry.path, reload_tx.clone())
    } else {
        None
    };
    let sighup = watcher::spawn_sighup_listener(reload_tx, cancel.clone())
        .context("Failed to install SIGHUP handler")?;
    let reload_task = tokio::spawn(watcher::run_reload_loop(
        Arc::clone(&registry),
        reload_rx,
        cancel.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;

    server::serve(listener, server::router(engine), shutdown_signal())
        .await
        .context("HTTP server failed")?;

    cancel.cancel();
    let _ = sighup.await;
    let _ = reload_task.await;

    info!("monagent shut down cleanly");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);

    match logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
