//! Config hot-reload watcher.
//!
//! Watches a `cadence.toml` file for modifications and invokes a callback
//! with the freshly parsed and validated [`OrchestratorConfig`] after a
//! debounce window.

use cadence_core::{CadenceError, CadenceResult};
use cadence_orchestrator::{OrchestratorConfig, WorkflowHandle};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

/// Watches a config file on disk and calls back on every (debounced) change.
///
/// Dropping the watcher releases the file-system watch, which also ends
/// the background thread.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path` for modifications.
    ///
    /// `on_reload` runs on a background thread each time the file is
    /// modified and parses into a valid configuration. Invalid files are
    /// logged and skipped, leaving the previous configuration in force.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> CadenceResult<Self>
    where
        F: Fn(OrchestratorConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| CadenceError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| CadenceError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let mut last_reload = std::time::Instant::now();
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // One reload per burst of writes.
                while rx.try_recv().is_ok() {}

                let since = last_reload.elapsed();
                if since < debounce {
                    std::thread::sleep(debounce - since);
                }
                last_reload = std::time::Instant::now();

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Failed to reload config"),
                }
            }

            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}

/// Read, parse and validate a configuration file.
pub fn parse_config(path: &Path) -> CadenceResult<OrchestratorConfig> {
    OrchestratorConfig::load(path)
}

/// Swap the workflow of `handle` for the one in `config`. Running agents
/// keep going; the next scheduling pass uses the new map.
pub fn apply_workflow(handle: &Arc<WorkflowHandle>, config: &OrchestratorConfig) -> CadenceResult<()> {
    handle.reload(config.workflow_map()?)
}
