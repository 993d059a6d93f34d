//! Configuration file watcher for hot reload.
//!
//! Consumers of the update channel apply the live-tunable settings: provider
//! rate limits, plus breaker and retry settings for services first seen after
//! the reload. Everything else needs a restart.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_with_env;
use crate::config::schema::AppConfig;

/// Editors often emit several events per save; reload at most once per window.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches one configuration file and publishes every valid reload.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<AppConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiving end of its update channel.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<AppConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Start watching. Updates flow only while the returned handle is alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let ConfigWatcher { path, update_tx } = self;
        let file_name = path.file_name().map(|n| n.to_os_string());
        let last_reload: Mutex<Option<Instant>> = Mutex::new(None);
        let reload_path = path.clone();

        let handler = move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(error = %e, "Config watch error");
                    return;
                }
            };

            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            let touches_config = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if !touches_config {
                return;
            }

            {
                let mut last = last_reload.lock().expect("reload timestamp mutex poisoned");
                if matches!(*last, Some(at) if at.elapsed() < RELOAD_DEBOUNCE) {
                    return;
                }
                *last = Some(Instant::now());
            }

            match load_with_env(Some(&reload_path)) {
                Ok(config) => {
                    tracing::info!(path = %reload_path.display(), "Configuration change detected");
                    if update_tx.send(config).is_err() {
                        tracing::debug!("Config update receiver gone, dropping reload");
                    }
                }
                Err(e) => {
                    tracing::error!(
                        path = %reload_path.display(),
                        error = %e,
                        "Rejected configuration change, keeping current settings"
                    );
                }
            }
        };

        let mut watcher = RecommendedWatcher::new(handler, Config::default().with_poll_interval(Duration::from_secs(2)))?;

        // Watch the directory so atomic-rename saves are still seen.
        let target = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        watcher.watch(&target, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %path.display(), "Config watcher started");
        Ok(watcher)
    }
}
