//! Routing document hot-reload watcher.
//!
//! ## Responsibility
//! Watch the gateway TOML file, rebuild the [`RuleTable`] from every valid
//! edit and swap it into the shared [`RuleTableHandle`]. Invalid edits are
//! logged and rejected; the current table stays in place.
//!
//! ## Guarantees
//! - Only validated documents reach the handle
//! - The swap is a single pointer replacement; readers never see a mix
//! - File watching is debounced to avoid rapid re-reads on multi-write editors
//! - Subscribers receive each new table via a `broadcast` channel
//!
//! ## NOT Responsible For
//! - Reloading non-routing sections (server, store and provider settings
//!   need a restart)
//! - Initial config loading (that belongs to `loader`)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use super::loader::{load_from_file_with_env, process_env};
use super::validation::ConfigError;
use crate::routing::{RuleTable, RuleTableHandle};

const DEBOUNCE: Duration = Duration::from_millis(500);
const POLL: Duration = Duration::from_millis(100);

/// Reload `path` into `handle` once.
///
/// # Errors
///
/// Any [`ConfigError`] from loading or compiling the document; `handle` is
/// untouched in that case.
pub fn reload_rules(path: &Path, handle: &RuleTableHandle) -> Result<Arc<RuleTable>, ConfigError> {
    let config = load_from_file_with_env(path, process_env)?;
    handle.reload(&config.routing)
}

/// Watches the gateway file and swaps in validated rule tables.
///
/// # Panics
///
/// This type never panics.
pub struct ConfigWatcher {
    tx: broadcast::Sender<Arc<RuleTable>>,
    /// Retained watcher handle; dropping this stops file watching.
    _watcher: Arc<Mutex<RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Start watching `path`, reloading into `handle` until `shutdown` fires.
    ///
    /// The initial table is **not** broadcast; load it with
    /// `loader::load_from_file` before starting the watcher.
    ///
    /// # Returns
    ///
    /// - `Ok((ConfigWatcher, Receiver))` on success.
    /// - `Err(ConfigError::Io)` if the file watcher cannot be created.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use prompt_gateway::config::watcher::ConfigWatcher;
    /// use std::path::PathBuf;
    ///
    /// let (watcher, mut rx) = ConfigWatcher::new(PathBuf::from("gateway.toml"), handle, token)?;
    /// tokio::spawn(async move {
    ///     while let Ok(table) = rx.recv().await {
    ///         println!("routing reloaded: {} rules", table.len());
    ///     }
    /// });
    /// ```
    pub fn new(
        path: PathBuf,
        handle: Arc<RuleTableHandle>,
        shutdown: CancellationToken,
    ) -> Result<(Self, broadcast::Receiver<Arc<RuleTable>>), ConfigError> {
        let (tx, rx) = broadcast::channel(8);
        let tx_clone = tx.clone();

        // Forward notify events from its own thread into the async task.
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| ConfigError::Io {
            file: path.display().to_string(),
            source: std::io::Error::other(e.to_string()),
        })?;

        // Watch the parent directory so atomic saves (write temp, rename)
        // are seen.
        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Io {
                file: watch_dir.display().to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;

        let watcher = Arc::new(Mutex::new(watcher));

        tokio::spawn(async move {
            // Time of the latest unapplied event; survives across polls.
            let mut pending: Option<Instant> = None;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("config watcher shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(POLL) => {}
                }

                while let Ok(event) = notify_rx.try_recv() {
                    if is_relevant(&event, &path) {
                        pending = Some(Instant::now());
                    }
                }

                // Reload once the file has been quiet for a full debounce window.
                if pending.is_some_and(|at| at.elapsed() >= DEBOUNCE) {
                    pending = None;
                    match reload_rules(&path, &handle) {
                        Ok(table) => {
                            tracing::info!(
                                path = %path.display(),
                                rules = table.len(),
                                generation = handle.generation(),
                                "routing rules reloaded"
                            );
                            // No receivers is fine; the handle was still updated.
                            let _ = tx_clone.send(table);
                        }
                        Err(e) => {
                            tracing::warn!(
                                path = %path.display(),
                                error = %e,
                                "config reload rejected, keeping current rules"
                            );
                        }
                    }
                }
            }
        });

        Ok((
            Self {
                tx,
                _watcher: watcher,
            },
            rx,
        ))
    }

    /// Subscribe to reload notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RuleTable>> {
        self.tx.subscribe()
    }
}

fn is_relevant(event: &notify::Event, path: &Path) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event.paths.iter().any(|p| p.file_name() == path.file_name())
}
