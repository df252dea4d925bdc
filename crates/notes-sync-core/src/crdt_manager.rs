//! CRDT Manager: in-memory registry of live note documents. Ref-counts them
//! across UI windows, serializes concurrent writes per note, and runs the
//! adaptive snapshot scheduler.

use crate::append_log::AppendLogManager;
use crate::activity::ActivityLogger;
use crate::comment_observer::CommentObserver;
use crate::document::NoteDocument;
use crate::error::{EngineError, StorageError};
use crate::events::{EngineEvent, EngineEventBus, EngineEventSubscription};
use crate::ids::{InstanceId, NoteId, SdId};
use crate::metadata_cache::{MetadataCache, NoteMetadataRow};
use crate::origin::Origin;
use crate::vector_clock::VectorClock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct LoadedNote {
    doc: NoteDocument,
    sd_id: SdId,
    vc: VectorClock,
    ref_count: u32,
    edit_count: u32,
    last_snapshot_check: Instant,
    last_snapshot_created: Instant,
    total_changes: u64,
}

/// Adaptive snapshot threshold from edits-per-minute, per the scheduling
/// guidance: busier notes snapshot more eagerly so the on-disk tail never
/// grows unbounded, idle ones snapshot rarely but not never.
fn snapshot_threshold(edits_per_minute: f64, idle_since_last_snapshot: Duration) -> u32 {
    if edits_per_minute > 10.0 {
        50
    } else if edits_per_minute > 5.0 {
        100
    } else if edits_per_minute > 1.0 {
        200
    } else if idle_since_last_snapshot > Duration::from_secs(30 * 60) {
        50
    } else {
        500
    }
}

struct SdHandles {
    append_log: Arc<AppendLogManager>,
    activity: Arc<ActivityLogger>,
}

pub struct CrdtManager {
    instance_id: InstanceId,
    sds: Mutex<HashMap<SdId, SdHandles>>,
    default_sd: Mutex<Option<SdId>>,
    notes: Mutex<HashMap<NoteId, Arc<Mutex<LoadedNote>>>>,
    comment_observer: Mutex<Option<Arc<CommentObserver>>>,
    metadata_cache: Arc<dyn MetadataCache>,
    events: Arc<EngineEventBus>,
}

impl CrdtManager {
    pub fn new(instance_id: InstanceId, metadata_cache: Arc<dyn MetadataCache>) -> Self {
        Self {
            instance_id,
            sds: Mutex::new(HashMap::new()),
            default_sd: Mutex::new(None),
            notes: Mutex::new(HashMap::new()),
            comment_observer: Mutex::new(None),
            metadata_cache,
            events: Arc::new(EngineEventBus::new()),
        }
    }

    /// Subscribe to engine-level notifications (`noteModified`, etc).
    pub fn subscribe(&self, callback: impl Fn(EngineEvent) + Send + Sync + 'static) -> EngineEventSubscription {
        self.events.subscribe(callback)
    }

    /// The shared bus, for callers (the engine facade's `MoveNote`/`Shutdown`
    /// handling) that need to emit events this manager doesn't originate.
    pub fn events(&self) -> Arc<EngineEventBus> {
        self.events.clone()
    }

    /// Wire a Comment Observer so `apply_update`/`reload_note` feed it
    /// fresh comment-map snapshots. Optional: without one, comment changes
    /// are still merged into the CRDT but no events are emitted.
    pub async fn set_comment_observer(&self, observer: Arc<CommentObserver>) {
        *self.comment_observer.lock().await = Some(observer);
    }

    async fn notify_comment_observer(&self, doc: &NoteDocument, is_remote: bool) {
        let observer = self.comment_observer.lock().await.clone();
        if let Some(observer) = observer {
            observer.observe(doc, is_remote, now_ms() as f64).await;
        }
    }

    pub async fn register_sd(&self, sd_id: SdId, append_log: Arc<AppendLogManager>, activity: Arc<ActivityLogger>) {
        let mut sds = self.sds.lock().await;
        let is_first = sds.is_empty();
        sds.insert(sd_id, SdHandles { append_log, activity });
        drop(sds);
        if is_first {
            *self.default_sd.lock().await = Some(sd_id);
        }
    }

    pub async fn unregister_sd(&self, sd_id: SdId) {
        self.sds.lock().await.remove(&sd_id);
        let mut default = self.default_sd.lock().await;
        if *default == Some(sd_id) {
            *default = None;
        }
    }

    async fn resolve_sd(&self, note_id: NoteId, hint: Option<SdId>) -> Result<SdId, EngineError> {
        if let Some(sd_id) = hint {
            return Ok(sd_id);
        }
        if let Some(loaded) = self.notes.lock().await.get(&note_id) {
            return Ok(loaded.lock().await.sd_id);
        }
        if let Some(row) = self.metadata_cache.get_note(note_id).await {
            return Ok(row.sd_id);
        }
        self.default_sd.lock().await.ok_or(EngineError::SdNotFound(SdId::new()))
    }

    /// Load a note into memory (cold-loading from disk if not already
    /// resident), bumping its reference count.
    pub async fn load_note(&self, note_id: NoteId, sd_hint: Option<SdId>) -> Result<(), EngineError> {
        let mut notes = self.notes.lock().await;
        if let Some(existing) = notes.get(&note_id) {
            existing.lock().await.ref_count += 1;
            return Ok(());
        }

        let sd_id = self.resolve_sd(note_id, sd_hint).await?;
        let sds = self.sds.lock().await;
        let handles = sds.get(&sd_id).ok_or(EngineError::SdNotFound(sd_id))?;
        let append_log = handles.append_log.clone();
        drop(sds);

        let start = Instant::now();
        let (doc, vc) = append_log.load_note(note_id).await.map_err(StorageError::Fs)?;
        debug!(note = %note_id, sd = %sd_id, elapsed_ms = start.elapsed().as_millis(), "cold-loaded note");

        notes.insert(
            note_id,
            Arc::new(Mutex::new(LoadedNote {
                doc,
                sd_id,
                vc,
                ref_count: 1,
                edit_count: 0,
                last_snapshot_check: Instant::now(),
                last_snapshot_created: Instant::now(),
                total_changes: 0,
            })),
        );
        Ok(())
    }

    pub async fn unload_note(&self, note_id: NoteId) {
        let slot = self.notes.lock().await.get(&note_id).cloned();
        let Some(slot) = slot else { return };
        let mut guard = slot.lock().await;
        guard.ref_count = guard.ref_count.saturating_sub(1);
        let should_drop = guard.ref_count == 0;
        if should_drop {
            self.maybe_snapshot(note_id, &mut guard, true).await;
        }
        drop(guard);
        if should_drop {
            self.notes.lock().await.remove(&note_id);
        }
    }

    pub async fn force_unload_note(&self, note_id: NoteId) {
        self.notes.lock().await.remove(&note_id);
    }

    pub async fn get_loaded_notes(&self) -> Vec<NoteId> {
        self.notes.lock().await.keys().copied().collect()
    }

    /// Apply a local edit: enqueue on the note's serial lock, write to
    /// disk, record activity, apply to the live doc tagged `Origin::Ipc`
    /// (never re-persisted), optionally bump `modifiedAt`.
    pub async fn apply_update(&self, note_id: NoteId, payload: Vec<u8>, skip_timestamp_update: bool) -> Result<(), EngineError> {
        let slot = self
            .notes
            .lock()
            .await
            .get(&note_id)
            .cloned()
            .ok_or(EngineError::NoteNotFound(note_id))?;

        let mut guard = slot.lock().await;
        let sd_id = guard.sd_id;

        let sds = self.sds.lock().await;
        let handles = sds.get(&sd_id).ok_or(EngineError::SdNotFound(sd_id))?;
        let append_log = handles.append_log.clone();
        let activity = handles.activity.clone();
        drop(sds);

        let coords = append_log.write_note_update(note_id, &payload).await.map_err(StorageError::Fs)?;
        activity.record_note_activity(note_id, coords.sequence).await.map_err(StorageError::Fs)?;

        guard
            .doc
            .apply_update(&payload, Origin::Ipc)
            .map_err(StorageError::Codec)?;
        guard.vc.advance(self.instance_id, coords.sequence, coords.offset, coords.file.clone());

        if !skip_timestamp_update {
            let now = now_ms();
            guard.doc.touch_modified(now);
        }

        guard.edit_count += 1;
        guard.total_changes += 1;
        self.maybe_snapshot(note_id, &mut guard, false).await;
        self.notify_comment_observer(&guard.doc, Origin::Ipc.is_remote()).await;

        self.metadata_cache.upsert_note(metadata_row(note_id, sd_id, &guard.doc)).await;
        if !skip_timestamp_update {
            self.events.emit(EngineEvent::NoteModified { note_id, sd_id });
        }

        Ok(())
    }

    /// Merge a peer's update (discovered via activity sync) into the live
    /// doc, tagged `Origin::Reload` so it is treated as already-on-disk.
    pub async fn reload_note(&self, note_id: NoteId) -> Result<(), EngineError> {
        let slot = self
            .notes
            .lock()
            .await
            .get(&note_id)
            .cloned()
            .ok_or(EngineError::NoteNotFound(note_id))?;

        let mut guard = slot.lock().await;
        let sd_id = guard.sd_id;
        let sds = self.sds.lock().await;
        let handles = sds.get(&sd_id).ok_or(EngineError::SdNotFound(sd_id))?;
        let append_log = handles.append_log.clone();
        drop(sds);

        let (fresh, fresh_vc) = append_log.load_note(note_id).await.map_err(StorageError::Fs)?;
        let update = fresh.export_update(Some(&guard.doc.state_vector()));
        let changed = !update.is_empty();
        if changed {
            guard.doc.apply_update(&update, Origin::Reload).map_err(StorageError::Codec)?;
        }
        guard.vc.merge_from(&fresh_vc);
        if changed {
            self.notify_comment_observer(&guard.doc, Origin::Reload.is_remote()).await;
            self.metadata_cache.upsert_note(metadata_row(note_id, sd_id, &guard.doc)).await;
            self.events.emit(EngineEvent::NoteModified { note_id, sd_id });
        }
        Ok(())
    }

    pub async fn check_crdt_log_exists(&self, note_id: NoteId, sd_id: SdId, instance_id: InstanceId, expected_sequence: u64) -> bool {
        let sds = self.sds.lock().await;
        let Some(handles) = sds.get(&sd_id) else { return false };
        let append_log = handles.append_log.clone();
        drop(sds);

        let Ok((_doc, vc)) = append_log.load_note(note_id).await else { return false };
        vc.has_absorbed(instance_id, expected_sequence)
    }

    pub async fn with_document<R>(&self, note_id: NoteId, f: impl FnOnce(&NoteDocument) -> R) -> Option<R> {
        let slot = self.notes.lock().await.get(&note_id).cloned()?;
        let guard = slot.lock().await;
        Some(f(&guard.doc))
    }

    async fn maybe_snapshot(&self, note_id: NoteId, guard: &mut LoadedNote, force: bool) {
        let elapsed_minutes = guard.last_snapshot_check.elapsed().as_secs_f64() / 60.0;
        let edits_per_minute = if elapsed_minutes > 0.0 { guard.edit_count as f64 / elapsed_minutes.max(1e-6) } else { 0.0 };
        let threshold = snapshot_threshold(edits_per_minute, guard.last_snapshot_created.elapsed());
        guard.last_snapshot_check = Instant::now();

        if !force && (guard.edit_count as u32) < threshold {
            return;
        }
        if guard.edit_count == 0 && !force {
            return;
        }

        let sd_id = guard.sd_id;
        let sds = self.sds.lock().await;
        let Some(handles) = sds.get(&sd_id) else { return };
        let append_log = handles.append_log.clone();
        drop(sds);

        match append_log.save_note_snapshot(note_id, &guard.doc, &guard.vc, guard.total_changes).await {
            Ok(()) => {
                info!(note = %note_id, edits = guard.edit_count, "snapshot created");
                guard.edit_count = 0;
                guard.last_snapshot_created = Instant::now();
            }
            Err(e) => warn!(note = %note_id, error = %e, "failed to write snapshot"),
        }
    }

    /// Count of loaded notes with unflushed edits, for shutdown progress UX.
    pub async fn pending_snapshot_count(&self) -> usize {
        let mut count = 0;
        for slot in self.notes.lock().await.values() {
            if slot.lock().await.edit_count > 0 {
                count += 1;
            }
        }
        count
    }

    /// Force a snapshot for every note with unflushed edits, reporting
    /// progress as `(done, total)` via `on_progress`.
    pub async fn flush_snapshots(&self, mut on_progress: impl FnMut(usize, usize)) {
        let note_ids: Vec<NoteId> = self.notes.lock().await.keys().copied().collect();
        let pending: Vec<NoteId> = {
            let mut out = Vec::new();
            for id in &note_ids {
                if let Some(slot) = self.notes.lock().await.get(id) {
                    if slot.lock().await.edit_count > 0 {
                        out.push(*id);
                    }
                }
            }
            out
        };
        let total = pending.len();
        for (i, note_id) in pending.into_iter().enumerate() {
            if let Some(slot) = self.notes.lock().await.get(&note_id).cloned() {
                let mut guard = slot.lock().await;
                self.maybe_snapshot(note_id, &mut guard, true).await;
            }
            on_progress(i + 1, total);
        }
    }

    /// Drain in-flight work. Every `apply_update` call already awaits its
    /// write before returning, so this only needs to wait for the per-note
    /// locks to be free.
    pub async fn flush(&self) {
        let note_ids: Vec<NoteId> = self.notes.lock().await.keys().copied().collect();
        for id in note_ids {
            if let Some(slot) = self.notes.lock().await.get(&id).cloned() {
                let _ = slot.lock().await;
            }
        }
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

/// Denormalize a live document into the row `MetadataCache` persists.
/// `sd_id` comes from the loaded note, not the document's own `metadata.sdId`
/// field, since the latter is only updated on cross-SD moves.
fn metadata_row(note_id: NoteId, sd_id: SdId, doc: &NoteDocument) -> NoteMetadataRow {
    let meta = doc.metadata();
    let preview = doc.to_plain_text();
    NoteMetadataRow {
        id: note_id,
        sd_id,
        folder_id: meta.folder_id.and_then(|s| s.parse().ok()),
        modified: meta.modified_at.unwrap_or(0),
        deleted: meta.deleted_at.is_some(),
        pinned: meta.pinned,
        title_text: meta.title,
        content_preview: (!preview.is_empty()).then_some(preview),
        tags: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::fs::InMemoryFs;
    use crate::metadata_cache::InMemoryMetadataCache;

    async fn setup() -> (Arc<CrdtManager>, SdId, NoteId) {
        let instance_id = InstanceId::new();
        let sd_id = SdId::new();
        let fs = Arc::new(InMemoryFs::new());
        let append_log = Arc::new(AppendLogManager::new(fs.clone(), "sd", sd_id, instance_id, EngineConfig::for_tests()));
        let activity = Arc::new(ActivityLogger::new(fs, "sd", instance_id));

        let manager = Arc::new(CrdtManager::new(instance_id, Arc::new(InMemoryMetadataCache::new())));
        manager.register_sd(sd_id, append_log, activity).await;

        let note_id = NoteId::new();
        manager.load_note(note_id, Some(sd_id)).await.unwrap();
        (manager, sd_id, note_id)
    }

    #[tokio::test]
    async fn apply_update_persists_and_applies_locally() {
        let (manager, _sd, note_id) = setup().await;

        let mut scratch = NoteDocument::new(note_id);
        scratch.set_title("From editor");
        let payload = scratch.export_update(None);

        manager.apply_update(note_id, payload, false).await.unwrap();

        let title = manager.with_document(note_id, |doc| doc.metadata().title.clone()).await.flatten();
        assert_eq!(title.as_deref(), Some("From editor"));
    }

    #[tokio::test]
    async fn ref_counting_keeps_note_loaded_until_last_unload() {
        let (manager, sd_id, note_id) = setup().await;
        manager.load_note(note_id, Some(sd_id)).await.unwrap(); // second window opens it
        manager.unload_note(note_id).await;
        assert!(manager.get_loaded_notes().await.contains(&note_id));
        manager.unload_note(note_id).await;
        assert!(!manager.get_loaded_notes().await.contains(&note_id));
    }

    #[tokio::test]
    async fn force_unload_drops_regardless_of_refcount() {
        let (manager, sd_id, note_id) = setup().await;
        manager.load_note(note_id, Some(sd_id)).await.unwrap();
        manager.force_unload_note(note_id).await;
        assert!(!manager.get_loaded_notes().await.contains(&note_id));
    }

    #[tokio::test]
    async fn apply_update_upserts_metadata_and_emits_note_modified() {
        let (manager, sd_id, note_id) = setup().await;
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let _sub = manager.subscribe(move |event| {
            if matches!(event, EngineEvent::NoteModified { .. }) {
                seen_clone.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        });

        let mut scratch = NoteDocument::new(note_id);
        scratch.set_title("Groceries");
        let payload = scratch.export_update(None);
        manager.apply_update(note_id, payload, false).await.unwrap();

        assert_eq!(seen.load(std::sync::atomic::Ordering::Relaxed), 1);
        let row = manager.metadata_cache.get_note(note_id).await.unwrap();
        assert_eq!(row.sd_id, sd_id);
        assert_eq!(row.title_text.as_deref(), Some("Groceries"));
    }

    #[tokio::test]
    async fn resolve_sd_falls_back_to_metadata_cache_for_unloaded_notes() {
        let (manager, sd_id, _note_id) = setup().await;
        let cold_note = NoteId::new();
        manager
            .metadata_cache
            .upsert_note(NoteMetadataRow {
                id: cold_note,
                sd_id,
                folder_id: None,
                modified: 0,
                deleted: false,
                pinned: false,
                title_text: None,
                content_preview: None,
                tags: Vec::new(),
            })
            .await;

        assert_eq!(manager.resolve_sd(cold_note, None).await.unwrap(), sd_id);
    }

    #[test]
    fn threshold_tightens_under_heavy_edit_rate() {
        assert_eq!(snapshot_threshold(20.0, Duration::ZERO), 50);
        assert_eq!(snapshot_threshold(7.0, Duration::ZERO), 100);
        assert_eq!(snapshot_threshold(2.0, Duration::ZERO), 200);
        assert_eq!(snapshot_threshold(0.1, Duration::from_secs(3600)), 50);
        assert_eq!(snapshot_threshold(0.1, Duration::ZERO), 500);
    }
}
