use std::path::{Path, PathBuf};

use anyhow::Result;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::LadderConfig;
use crate::config_loader::ConfigLoader;

/// Hot-reloads the ladder configuration from disk.
///
/// Invalid edits are logged and ignored; subscribers keep the last good config.
pub struct ConfigWatcher {
    tx: watch::Sender<LadderConfig>,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Returns the watcher together with a receiver seeded with `initial`.
    #[must_use]
    pub fn new(
        initial: LadderConfig,
        path: impl Into<PathBuf>,
    ) -> (Self, watch::Receiver<LadderConfig>) {
        let (tx, rx) = watch::channel(initial);
        (
            Self {
                tx,
                path: path.into(),
            },
            rx,
        )
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LadderConfig> {
        self.tx.subscribe()
    }

    /// Re-reads the file and publishes it if it is valid and changed.
    ///
    /// Returns whether a new configuration was published.
    pub fn reload(&self) -> bool {
        match ConfigLoader::load_from(&self.path) {
            Ok(config) => {
                let changed = self.tx.send_if_modified(|current| {
                    if *current == config {
                        false
                    } else {
                        *current = config;
                        true
                    }
                });
                if changed {
                    info!(path = %self.path.display(), "Ladder config reloaded");
                }
                changed
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to reload ladder config");
                false
            }
        }
    }

    /// Watches the file for modifications until the watcher channel closes.
    ///
    /// # Errors
    ///
    /// Returns an error if file watching cannot be initiated or if the watcher task fails.
    pub async fn watch(self) -> Result<()> {
        tokio::task::spawn_blocking(move || {
            let (notify_tx, notify_rx) = std::sync::mpsc::channel();

            let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            })?;

            watcher.watch(Path::new(&self.path), RecursiveMode::NonRecursive)?;
            info!(path = %self.path.display(), "Watching ladder config");

            for event in notify_rx {
                match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) => {
                        self.reload();
                    }
                    EventKind::Remove(_) => {
                        warn!(path = %self.path.display(), "Ladder config removed, keeping last good config");
                    }
                    _ => {}
                }
                if self.tx.is_closed() {
                    break;
                }
            }

            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }
}
