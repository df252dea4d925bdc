//! notes-sync-daemon library: wires the engine's SD Router, per-directory
//! watchers and periodic packing/GC/snapshot schedulers into a runnable
//! process. Exposed as a library (not just a `main.rs`) so integration
//! tests can drive a daemon instance without going through argv/stdout.

pub mod native_fs;
pub mod watcher;

pub use native_fs::NativeFs;
pub use watcher::{SdFileEvent, SdWatcher};

use anyhow::Result;
use notes_sync_core::{
    ActivitySync, CommentObserver, CrdtManager, EngineConfig, EngineEventSubscription, EventBus, FileSystem,
    InMemoryMetadataCache, InstanceId, MetadataCache, NoteId, SdId, SdRouter, Subscription,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A running daemon: one SD Router, one watcher task per storage
/// directory (funnelling into a single channel this struct drains), and
/// the three periodic schedulers described for the concurrency model.
pub struct Daemon {
    pub router: Arc<SdRouter>,
    pub crdt_manager: Arc<CrdtManager>,
    pub activity_sync: Arc<ActivitySync>,
    pub event_bus: Arc<EventBus>,
    pub metadata_cache: Arc<dyn MetadataCache>,
    comment_observer: Arc<CommentObserver>,
    config: EngineConfig,
    sd_roots: HashMap<SdId, PathBuf>,
    events: mpsc::UnboundedReceiver<(SdId, SdFileEvent)>,
    _comment_log_sub: Subscription,
    _engine_log_sub: EngineEventSubscription,
}

impl Daemon {
    /// Bootstrap the router against every path in `sd_roots`, spawn a
    /// watcher task per SD, and return a handle ready for `run`.
    pub async fn start(
        fs: Arc<dyn FileSystem>,
        sd_roots: &[PathBuf],
        instance_id: InstanceId,
        config: EngineConfig,
    ) -> Result<Self> {
        let metadata_cache: Arc<dyn MetadataCache> = Arc::new(InMemoryMetadataCache::new());
        let crdt_manager = Arc::new(CrdtManager::new(instance_id, metadata_cache.clone()));
        let router = Arc::new(SdRouter::new(fs.clone(), instance_id, config.clone(), crdt_manager.clone(), metadata_cache.clone()));
        let activity_sync = Arc::new(ActivitySync::new(fs.clone(), crdt_manager.clone(), instance_id, config.clone(), metadata_cache.clone()));

        let event_bus = Arc::new(EventBus::new());
        let comment_observer = Arc::new(CommentObserver::new(event_bus.clone(), config.comment_debounce));
        crdt_manager.set_comment_observer(comment_observer.clone()).await;
        let debug_comment_sync = config.debug_comment_sync;
        let comment_log_sub = event_bus.subscribe(move |event| {
            if debug_comment_sync {
                debug!(?event, "comment event");
            }
        });
        let engine_log_sub = crdt_manager.subscribe(move |event| {
            if debug_comment_sync {
                debug!(?event, "engine event");
            }
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let mut roots = HashMap::new();

        for root in sd_roots {
            let root = root.canonicalize().unwrap_or_else(|_| root.clone());
            let root_str = root.to_string_lossy().to_string();
            let sd_id = router.open_sd(&root_str).await?;
            roots.insert(sd_id, root.clone());

            let mut watcher = SdWatcher::new(root.clone(), config.watch_debounce, config.startup_grace_period)?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(event) = watcher.event_rx().recv().await {
                    if tx.send((sd_id, event)).is_err() {
                        break;
                    }
                }
            });
        }

        Ok(Self {
            router,
            crdt_manager,
            activity_sync,
            event_bus,
            metadata_cache,
            comment_observer,
            config,
            sd_roots: roots,
            events: rx,
            _comment_log_sub: comment_log_sub,
            _engine_log_sub: engine_log_sub,
        })
    }

    /// Drive watcher-triggered reloads/activity-sync and the periodic
    /// packing/GC/snapshot-check/comment-debounce schedulers until
    /// `ctrl_c` fires, then flush any unsaved snapshots before returning.
    pub async fn run(mut self) -> Result<()> {
        let mut packing = tokio::time::interval(self.config.packing_interval);
        let mut gc = tokio::time::interval(self.config.gc_interval);
        let mut snapshot_check = tokio::time::interval(self.config.snapshot_check_interval);
        let mut comment_flush = tokio::time::interval(self.config.comment_debounce);

        loop {
            tokio::select! {
                Some((sd_id, event)) = self.events.recv() => {
                    self.on_sd_event(sd_id, event).await;
                }
                _ = packing.tick() => {
                    self.run_packing().await;
                }
                _ = gc.tick() => {
                    self.run_gc().await;
                }
                _ = snapshot_check.tick() => {
                    self.crdt_manager.flush_snapshots(|_, _| {}).await;
                }
                _ = comment_flush.tick() => {
                    self.comment_observer.flush_due().await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        let pending = self.crdt_manager.pending_snapshot_count().await;
        if pending > 0 {
            info!(pending, "flushing snapshots before exit");
            self.crdt_manager
                .flush_snapshots(|done, total| debug!(done, total, "snapshot flush progress"))
                .await;
        }
        Ok(())
    }

    async fn on_sd_event(&self, sd_id: SdId, event: SdFileEvent) {
        if event.path.starts_with(".activity/") {
            if let Some(root) = self.sd_roots.get(&sd_id) {
                if let Err(e) = self.activity_sync.sync_sd(sd_id, &root.to_string_lossy()).await {
                    warn!(sd = %sd_id, error = %e, "activity sync failed");
                }
            }
            return;
        }

        if let Some(note_id) = parse_note_id(&event.path) {
            if self.crdt_manager.get_loaded_notes().await.contains(&note_id) {
                if let Err(e) = self.crdt_manager.reload_note(note_id).await {
                    warn!(note = %note_id, error = %e, "reload after watcher event failed");
                }
            }
        }
    }

    async fn run_packing(&self) {
        for (sd_id, _) in self.router.roots().await {
            let (Some(append_log), Some(activity)) =
                (self.router.append_log(sd_id).await, self.router.activity_logger(sd_id).await)
            else {
                continue;
            };
            let Ok(notes) = append_log.list_notes().await else { continue };
            for note_id in notes {
                if let Err(e) = append_log.pack_note_if_eligible(note_id, now_ms(), &activity).await {
                    warn!(note = %note_id, error = %e, "packing failed");
                }
            }
        }
    }

    async fn run_gc(&self) {
        for (sd_id, _) in self.router.roots().await {
            let Some(append_log) = self.router.append_log(sd_id).await else { continue };
            let Ok(notes) = append_log.list_notes().await else { continue };
            for note_id in notes {
                if let Err(e) = append_log.gc_note(note_id).await {
                    warn!(note = %note_id, error = %e, "gc failed");
                }
            }
        }
    }
}

fn parse_note_id(path: &str) -> Option<NoteId> {
    let rest = path.strip_prefix("notes/")?;
    let id_str = rest.split('/').next()?;
    id_str.parse().ok()
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
