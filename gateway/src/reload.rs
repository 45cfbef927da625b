//! Hot reload of the compiled routes file.
//!
//! The containing directory is watched (ConfigMap mounts replace the file
//! via symlink swaps); a short debounce lets the writer finish before the
//! table is reloaded. A file that fails to parse leaves the previous
//! table live.

use crate::api::ApiState;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watch the routes file and reload the table on change. The watcher
/// lives inside the spawned task.
pub fn watch_routes_file(path: PathBuf, state: Arc<ApiState>) -> notify::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |result: notify::Result<Event>| {
            let _ = tx.send(result);
        })?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    info!("Watching {} for changes", path.display());

    tokio::spawn(async move {
        // Keeps the watcher registered for the lifetime of the task
        let _watcher = watcher;

        while let Some(event) = rx.recv().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    error!("Routes file watcher error: {e}");
                    continue;
                }
            };

            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            let ours = event
                .paths
                .iter()
                .any(|p| p.file_name() == path.file_name());
            if !ours {
                continue;
            }

            info!("Routes file changed, reloading...");
            tokio::time::sleep(DEBOUNCE).await;

            // Coalesce the burst of events a ConfigMap swap produces
            while rx.try_recv().is_ok() {}

            match state.table.load_from_file(&path) {
                Ok(()) => {
                    state.apply_table_defaults();
                    info!("Routes reloaded successfully");
                }
                Err(e) => warn!("Failed to reload routes: {e}"),
            }
        }
    });

    Ok(())
}
