//! Filesystem watcher for one storage directory. Coalesces rapid-fire
//! writes with a short debounce and swallows the burst of create events
//! that fire while the SD Router is still doing its own initial load.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error};

const WATCHED_DIRS: &[&str] = &["notes", "folders", ".activity"];

#[derive(Debug, Clone)]
pub struct SdFileEvent {
    /// Path relative to the SD root.
    pub path: String,
}

pub struct SdWatcher {
    sd_root: PathBuf,
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<SdFileEvent>,
}

impl SdWatcher {
    /// Watch `sd_root`'s `notes/`, `folders/` and `.activity/` subtrees.
    /// Events observed before `startup_grace_period` has elapsed since this
    /// call are dropped - the router's own initial load already accounts
    /// for whatever is on disk at open time, and cloud-sync backends are
    /// prone to firing a storm of synthetic create events on first watch.
    pub fn new(sd_root: PathBuf, watch_debounce: Duration, startup_grace_period: Duration) -> Result<Self> {
        let sd_root = sd_root.canonicalize().unwrap_or(sd_root);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root_clone = sd_root.clone();
        let started_at = Instant::now();

        let mut debouncer = new_debouncer(watch_debounce, move |result: Result<Vec<DebouncedEvent>, notify::Error>| {
            match result {
                Ok(events) => {
                    if started_at.elapsed() < startup_grace_period {
                        return;
                    }
                    for event in events {
                        if let Some(file_event) = Self::process_event(&event, &root_clone) {
                            if event_tx.send(file_event).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => error!("watcher error: {e}"),
            }
        })?;

        for dir in WATCHED_DIRS {
            let path = sd_root.join(dir);
            if path.exists() {
                debouncer.watcher().watch(&path, RecursiveMode::Recursive)?;
            }
        }

        Ok(Self { sd_root, _debouncer: debouncer, event_rx })
    }

    fn process_event(event: &DebouncedEvent, sd_root: &Path) -> Option<SdFileEvent> {
        let relative = event.path.strip_prefix(sd_root).ok()?;
        let relative_str = relative.to_str()?;
        debug!(path = relative_str, "sd file event");
        Some(SdFileEvent { path: relative_str.replace('\\', "/") })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<SdFileEvent> {
        &mut self.event_rx
    }

    pub fn sd_root(&self) -> &Path {
        &self.sd_root
    }
}
