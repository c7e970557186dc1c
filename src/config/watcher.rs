//! File watcher — monitors the gate config file and triggers hot reload
//!
//! Uses the `notify` crate for cross-platform file system events
//! (inotify on Linux, kqueue on macOS, ReadDirectoryChanges on Windows).

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use super::GateConfig;
use crate::error::{GateError, Result};

/// Debounce interval to coalesce rapid file changes
const DEBOUNCE_MS: u64 = 500;

/// Watches one HCL config file
pub struct FileWatcher {
    config_path: PathBuf,
    /// Last configuration that parsed and validated
    last_config: Arc<RwLock<Option<GateConfig>>>,
    reload_count: Arc<AtomicU64>,
}

/// Emitted when the config file changes
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    pub trigger_path: PathBuf,
    /// New configuration, or why it was rejected
    pub config: std::result::Result<GateConfig, String>,
    pub timestamp: Instant,
}

impl FileWatcher {
    pub fn new(config_path: impl AsRef<Path>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            last_config: Arc::new(RwLock::new(None)),
            reload_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn reload_count(&self) -> u64 {
        self.reload_count.load(Ordering::Relaxed)
    }

    pub fn last_config(&self) -> Option<GateConfig> {
        self.last_config.read().unwrap().clone()
    }

    /// Load and validate the config file
    pub fn load_config(&self) -> Result<GateConfig> {
        let config = read_config(&self.config_path)?;
        *self.last_config.write().unwrap() = Some(config.clone());
        Ok(config)
    }

    /// Start watching. A background thread owns the `notify` watcher and
    /// forwards debounced reload events to the returned channel.
    pub fn watch(&self) -> Result<UnboundedReceiver<ReloadEvent>> {
        let (event_tx, event_rx) = unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::channel();

        let config_path = self.config_path.clone();
        let last_config = self.last_config.clone();
        let reload_count = self.reload_count.clone();

        let mut watcher: RecommendedWatcher = Watcher::new(notify_tx, notify::Config::default())
            .map_err(|e| GateError::Other(format!("Failed to create file watcher: {}", e)))?;

        // Editors replace files by rename, so watch the parent directory
        let watch_path = match config_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                GateError::Other(format!("Failed to watch {}: {}", watch_path.display(), e))
            })?;

        std::thread::spawn(move || {
            let _watcher = watcher;
            let mut last_event_time: Option<Instant> = None;

            loop {
                let event = match notify_rx.recv() {
                    Ok(Ok(event)) => event,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "File watcher error");
                        continue;
                    }
                    // Watcher dropped
                    Err(_) => break,
                };

                if !is_relevant_event(&event, &config_path) {
                    continue;
                }

                let now = Instant::now();
                if last_event_time
                    .is_some_and(|t| now.duration_since(t) < Duration::from_millis(DEBOUNCE_MS))
                {
                    continue;
                }
                last_event_time = Some(now);

                let trigger_path = event
                    .paths
                    .first()
                    .cloned()
                    .unwrap_or_else(|| config_path.clone());

                let config = read_config(&config_path);
                match &config {
                    Ok(config) => {
                        *last_config.write().unwrap() = Some(config.clone());
                        reload_count.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Config reload failed, keeping previous config");
                    }
                }

                let sent = event_tx.send(ReloadEvent {
                    trigger_path,
                    config: config.map_err(|e| e.to_string()),
                    timestamp: now,
                });
                if sent.is_err() {
                    break;
                }
            }
        });

        Ok(event_rx)
    }
}

fn read_config(path: &Path) -> Result<GateConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        GateError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    let config = GateConfig::from_hcl(&content)?;
    config.validate()?;
    Ok(config)
}

/// Whether a file system event touches the config file
fn is_relevant_event(event: &Event, config_path: &Path) -> bool {
    let kind = matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    );
    kind && event
        .paths
        .iter()
        .any(|p| p.file_name() == config_path.file_name())
}
