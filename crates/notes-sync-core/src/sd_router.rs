//! SD Router: owns the per-storage-directory managers and the bootstrap
//! sequence for bringing a new SD online - reading or minting its identity,
//! creating the top-level layout, and registering handles with the CRDT
//! Manager.

use crate::activity::ActivityLogger;
use crate::append_log::AppendLogManager;
use crate::config::EngineConfig;
use crate::crdt_manager::CrdtManager;
use crate::error::{EngineError, StorageError};
use crate::fs::FileSystem;
use crate::ids::{ImageId, InstanceId, NoteId, SdId};
use crate::metadata_cache::MetadataCache;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SD_ID_FILE: &str = "SD_ID";
const LEGACY_SD_ID_FILE: &str = ".sd-id";
const MEDIA_DIR: &str = "media";
const TOP_LEVEL_DIRS: &[&str] = &["notes", "folders", ".activity", MEDIA_DIR];

/// How a `move_note` call should handle a `noteId` that already exists in
/// the target SD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Overwrite whatever is already in the target under this id.
    Replace,
    /// Keep the target's existing note and recreate the moved one under a
    /// freshly minted id.
    KeepBoth,
    /// Leave the target untouched and fail with `CrossSdMoveConflict`.
    Cancel,
}

struct SdEntry {
    root: String,
    append_log: Arc<AppendLogManager>,
    activity: Arc<ActivityLogger>,
}

/// Resolves `sdId` for a runtime "which SD do I use" question and owns the
/// bootstrap/teardown lifecycle for each registered storage directory.
pub struct SdRouter {
    fs: Arc<dyn FileSystem>,
    instance_id: InstanceId,
    config: EngineConfig,
    crdt_manager: Arc<CrdtManager>,
    metadata_cache: Arc<dyn MetadataCache>,
    sds: Mutex<HashMap<SdId, SdEntry>>,
}

impl SdRouter {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        instance_id: InstanceId,
        config: EngineConfig,
        crdt_manager: Arc<CrdtManager>,
        metadata_cache: Arc<dyn MetadataCache>,
    ) -> Self {
        Self { fs, instance_id, config, crdt_manager, metadata_cache, sds: Mutex::new(HashMap::new()) }
    }

    /// Bring an SD online at `root`: read/migrate its `SD_ID`, create the
    /// top-level layout, wire up an Append-Log Manager and Activity Logger,
    /// register both with the CRDT Manager, and kick off a background scan
    /// that registers any unregistered media files. Idempotent per root.
    pub async fn open_sd(&self, root: &str) -> crate::fs::Result<SdId> {
        let sd_id = self.read_or_mint_sd_id(root).await?;

        for dir in TOP_LEVEL_DIRS {
            self.fs.mkdir(&format!("{root}/{dir}")).await?;
        }

        let append_log = Arc::new(AppendLogManager::new(self.fs.clone(), root, sd_id, self.instance_id, self.config.clone()));
        let activity = Arc::new(ActivityLogger::new(self.fs.clone(), root, self.instance_id));

        self.crdt_manager.register_sd(sd_id, append_log.clone(), activity.clone()).await;
        self.sds.lock().await.insert(sd_id, SdEntry { root: root.to_string(), append_log, activity });
        info!(sd = %sd_id, root, "storage directory opened");

        let fs = self.fs.clone();
        let metadata_cache = self.metadata_cache.clone();
        let root = root.to_string();
        tokio::spawn(async move {
            if let Err(e) = scan_media_dir(&*fs, &*metadata_cache, sd_id, &root).await {
                warn!(sd = %sd_id, error = %e, "media directory scan failed");
            }
        });

        Ok(sd_id)
    }

    /// Scan `{root}/media` and register any file not already known to the
    /// MetadataCache. Runs in the background after `open_sd`; exposed
    /// directly so tests can await its completion deterministically.
    pub async fn scan_media(&self, sd_id: SdId) -> Result<usize, EngineError> {
        let root = self.sds.lock().await.get(&sd_id).map(|e| e.root.clone()).ok_or(EngineError::SdNotFound(sd_id))?;
        scan_media_dir(&*self.fs, &*self.metadata_cache, sd_id, &root).await.map_err(|e| StorageError::Fs(e).into())
    }

    pub async fn close_sd(&self, sd_id: SdId) {
        self.sds.lock().await.remove(&sd_id);
        self.crdt_manager.unregister_sd(sd_id).await;
    }

    async fn read_or_mint_sd_id(&self, root: &str) -> crate::fs::Result<SdId> {
        let path = format!("{root}/{SD_ID_FILE}");
        if let Ok(bytes) = self.fs.read(&path).await {
            if let Ok(id) = String::from_utf8_lossy(&bytes).trim().parse() {
                return Ok(id);
            }
        }

        let legacy_path = format!("{root}/{LEGACY_SD_ID_FILE}");
        if let Ok(bytes) = self.fs.read(&legacy_path).await {
            if let Ok(id) = String::from_utf8_lossy(&bytes).trim().parse::<SdId>() {
                self.fs.write_atomic(&path, id.to_string().as_bytes()).await?;
                self.fs.delete(&legacy_path).await.ok();
                info!(sd = %id, root, "migrated legacy SD identity file");
                return Ok(id);
            }
        }

        let id = SdId::new();
        self.fs.write_atomic(&path, id.to_string().as_bytes()).await?;
        info!(sd = %id, root, "minted new storage directory identity");
        Ok(id)
    }

    pub async fn roots(&self) -> Vec<(SdId, String)> {
        self.sds.lock().await.iter().map(|(id, e)| (*id, e.root.clone())).collect()
    }

    pub async fn activity_logger(&self, sd_id: SdId) -> Option<Arc<ActivityLogger>> {
        self.sds.lock().await.get(&sd_id).map(|e| e.activity.clone())
    }

    pub async fn append_log(&self, sd_id: SdId) -> Option<Arc<AppendLogManager>> {
        self.sds.lock().await.get(&sd_id).map(|e| e.append_log.clone())
    }

    /// Move a note between SDs: export its full state into a fresh
    /// snapshot-and-empty-log under `target_sd`, tombstone the original
    /// metadata in place, and record activity in both SDs. Returns the id
    /// the moved note ends up under in `target_sd` - the original
    /// `note_id` unless `conflict_resolution` is `KeepBoth` and a
    /// collision forced a fresh one.
    pub async fn move_note(
        &self,
        note_id: NoteId,
        source_sd: SdId,
        target_sd: SdId,
        now_ms: u64,
        conflict_resolution: ConflictResolution,
    ) -> Result<NoteId, EngineError> {
        let sds = self.sds.lock().await;
        let source = sds.get(&source_sd).ok_or(EngineError::SdNotFound(source_sd))?;
        let target = sds.get(&target_sd).ok_or(EngineError::SdNotFound(target_sd))?;
        let (source_append_log, source_activity) = (source.append_log.clone(), source.activity.clone());
        let (target_append_log, target_activity) = (target.append_log.clone(), target.activity.clone());
        drop(sds);

        let target_has_collision = target_append_log.list_notes().await.map_err(StorageError::Fs)?.contains(&note_id);
        let target_note_id = if target_has_collision {
            match conflict_resolution {
                ConflictResolution::Cancel => {
                    return Err(EngineError::Storage(StorageError::CrossSdMoveConflict { note: note_id, sd: target_sd }));
                }
                ConflictResolution::Replace => note_id,
                ConflictResolution::KeepBoth => NoteId::new(),
            }
        } else {
            note_id
        };

        let (doc, _vc) = source_append_log.load_note(note_id).await.map_err(StorageError::Fs)?;
        let full_state = doc.export_snapshot();

        let mut moved = crate::document::NoteDocument::from_state(target_note_id, &full_state).map_err(StorageError::Codec)?;
        moved.set_sd_and_folder(&target_sd.to_string(), None);

        target_append_log
            .save_note_snapshot(target_note_id, &moved, &crate::vector_clock::VectorClock::new(), 0)
            .await
            .map_err(StorageError::Fs)?;
        target_activity.record_note_activity(target_note_id, 0).await.map_err(StorageError::Fs)?;

        let mut tombstone = crate::document::NoteDocument::from_state(note_id, &full_state).map_err(StorageError::Codec)?;
        tombstone.mark_deleted(now_ms);
        let tombstone_update = tombstone.export_update(Some(&doc.state_vector()));
        let coords = source_append_log
            .write_note_update(note_id, &tombstone_update)
            .await
            .map_err(StorageError::Fs)?;
        source_activity.record_note_activity(note_id, coords.sequence).await.map_err(StorageError::Fs)?;

        Ok(target_note_id)
    }
}

/// Register every file under `{root}/media` not already known to the
/// cache. Filenames are parsed as `ImageId` (stem only - extensions, if
/// any, are stripped before parsing); anything that doesn't parse is
/// skipped rather than treated as an error.
async fn scan_media_dir(fs: &dyn FileSystem, cache: &dyn MetadataCache, sd_id: SdId, root: &str) -> crate::fs::Result<usize> {
    let dir = format!("{root}/{MEDIA_DIR}");
    let entries = match fs.list(&dir).await {
        Ok(entries) => entries,
        Err(crate::error::FsError::NotFound(_)) => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut registered = 0;
    for entry in entries.into_iter().filter(|e| !e.is_dir) {
        let stem = entry.name.split('.').next().unwrap_or(&entry.name);
        let Ok(image_id) = stem.parse::<ImageId>() else { continue };
        if !cache.is_media_registered(sd_id, &image_id).await {
            cache.register_media(sd_id, image_id).await;
            registered += 1;
        }
    }
    Ok(registered)
}
