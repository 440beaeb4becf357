//! Registry hot-reload
//!
//! Reload requests come from two places: a filesystem watcher on the
//! definition file and SIGHUP. Both feed one channel drained by a single
//! task, so reloads never run concurrently with each other.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::Registry;

/// Editors emit bursts of events for one save
const DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    FileChanged,
    Signal,
}

/// Watch the directory holding `path` and send a trigger whenever that file
/// is created or modified. The watcher stops when the returned handle drops.
pub fn start_file_watcher(
    path: &Path,
    tx: mpsc::UnboundedSender<ReloadTrigger>,
) -> Option<RecommendedWatcher> {
    let Some(file_name) = path.file_name().map(|n| n.to_os_string()) else {
        warn!("Registry path {} has no file name, not watching", path.display());
        return None;
    };
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };

    let mut watcher =
        match notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()));
                if ours && matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    debug!("Registry file event: {:?}", event.kind);
                    let _ = tx.send(ReloadTrigger::FileChanged);
                }
            }
            Err(e) => {
                warn!("Registry watcher error: {e}");
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!("Failed to create registry watcher: {e}");
                return None;
            }
        };

    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        warn!("Failed to watch {}: {e}", dir.display());
        return None;
    }

    info!("Watching {} for registry changes", path.display());
    Some(watcher)
}

/// Forward SIGHUP as reload triggers until cancelled
#[cfg(unix)]
pub fn spawn_sighup_listener(
    tx: mpsc::UnboundedSender<ReloadTrigger>,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received SIGHUP, reloading registry");
                    if tx.send(ReloadTrigger::Signal).is_err() {
                        break;
                    }
                }
            }
        }
    }))
}

/// Apply reload triggers to `registry` until cancelled or every sender is gone
pub async fn run_reload_loop(
    registry: Arc<Registry>,
    mut rx: mpsc::UnboundedReceiver<ReloadTrigger>,
    cancel: CancellationToken,
) {
    loop {
        let trigger = tokio::select! {
            _ = cancel.cancelled() => break,
            trigger = rx.recv() => match trigger {
                Some(t) => t,
                None => break,
            },
        };

        // Coalesce the rest of the burst
        tokio::time::sleep(DEBOUNCE).await;
        while rx.try_recv().is_ok() {}

        debug!("Reloading registry ({trigger:?})");
        let target = Arc::clone(&registry);
        match tokio::task::spawn_blocking(move || target.reload_configured()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Registry reload failed, previous commands stay active: {e}"),
            Err(e) => warn!("Registry reload task failed: {e}"),
        }
    }
    debug!("Registry reload loop stopped");
}
