//! Activity Sync: watches every peer's activity log per SD, verifies the
//! underlying `.crdtlog`/pack/snapshot data has actually arrived, and
//! triggers reloads of loaded notes. Entries whose data never arrives
//! within the retry budget become stale-sync entries the UI can retry or
//! skip.

use crate::activity::{self, ActivityLogger};
use crate::config::EngineConfig;
use crate::crdt_manager::CrdtManager;
use crate::fs::FileSystem;
use crate::ids::{InstanceId, NoteId, SdId};
use crate::metadata_cache::MetadataCache;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleSyncEntry {
    pub sd_id: SdId,
    pub note_id: NoteId,
    pub instance_id: InstanceId,
    pub sequence: u64,
    pub attempts: u32,
}

#[derive(Clone, Copy)]
struct RetryState {
    sequence: u64,
    attempts: u32,
}

type PendingKey = (SdId, NoteId, InstanceId);

pub struct ActivitySync {
    fs: Arc<dyn FileSystem>,
    crdt_manager: Arc<CrdtManager>,
    config: EngineConfig,
    instance_id: InstanceId,
    metadata_cache: Arc<dyn MetadataCache>,
    pending: Mutex<HashMap<PendingKey, RetryState>>,
    stale: Mutex<HashMap<PendingKey, RetryState>>,
}

impl ActivitySync {
    pub fn new(fs: Arc<dyn FileSystem>, crdt_manager: Arc<CrdtManager>, instance_id: InstanceId, config: EngineConfig, metadata_cache: Arc<dyn MetadataCache>) -> Self {
        Self {
            fs,
            crdt_manager,
            config,
            instance_id,
            metadata_cache,
            pending: Mutex::new(HashMap::new()),
            stale: Mutex::new(HashMap::new()),
        }
    }

    /// One sync pass for a single SD: read every peer's activity log tail,
    /// group new entries by note, and attempt to apply each.
    pub async fn sync_sd(&self, sd_id: SdId, sd_root: &str) -> crate::fs::Result<()> {
        let logger = ActivityLogger::new(self.fs.clone(), sd_root, self.instance_id);
        for (peer_instance, path) in logger.list_peer_logs().await? {
            if peer_instance == self.instance_id {
                continue;
            }
            self.sync_peer_log(sd_id, peer_instance, &path).await?;
        }
        self.retry_pending(sd_id).await;
        Ok(())
    }

    async fn sync_peer_log(&self, sd_id: SdId, peer_instance: InstanceId, path: &str) -> crate::fs::Result<()> {
        let content = match self.fs.read(path).await {
            Ok(bytes) => bytes,
            Err(crate::error::FsError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let content = String::from_utf8_lossy(&content).into_owned();
        let all_lines: Vec<&str> = content.lines().collect();

        let applied = self.metadata_cache.get_last_applied_offset(sd_id, peer_instance).await.unwrap_or(0) as usize;
        let start = applied.min(all_lines.len());
        let new_lines = &all_lines[start..];

        let mut per_note: HashMap<NoteId, u64> = HashMap::new();
        for line in new_lines {
            if let Some(parsed) = activity::parse_line(line) {
                per_note
                    .entry(parsed.note_id)
                    .and_modify(|seq| *seq = (*seq).max(parsed.sequence))
                    .or_insert(parsed.sequence);
            }
        }
        self.metadata_cache.set_last_applied_offset(sd_id, peer_instance, all_lines.len() as u64).await;

        for (note_id, sequence) in per_note {
            self.try_apply(sd_id, note_id, peer_instance, sequence).await;
        }
        Ok(())
    }

    async fn try_apply(&self, sd_id: SdId, note_id: NoteId, peer_instance: InstanceId, sequence: u64) {
        let present = self.crdt_manager.check_crdt_log_exists(note_id, sd_id, peer_instance, sequence).await;
        let key = (sd_id, note_id, peer_instance);

        if !present {
            if self.stale.lock().await.contains_key(&key) {
                return; // already surfaced as stale; wait for an explicit retry
            }
            let mut pending = self.pending.lock().await;
            let attempts = pending.get(&key).map(|s| s.attempts + 1).unwrap_or(1);
            if attempts >= self.config.stale_sync_retry_attempts {
                pending.remove(&key);
                drop(pending);
                self.stale.lock().await.insert(key, RetryState { sequence, attempts });
                warn!(note = %note_id, instance = %peer_instance, sequence, "activity entry became stale after retry budget");
            } else {
                pending.insert(key, RetryState { sequence, attempts });
            }
            return;
        }

        self.pending.lock().await.remove(&key);
        self.stale.lock().await.remove(&key);

        if self.crdt_manager.get_loaded_notes().await.contains(&note_id) {
            if let Err(e) = self.crdt_manager.reload_note(note_id).await {
                warn!(note = %note_id, error = %e, "failed to reload note after activity sync");
            } else {
                debug!(note = %note_id, instance = %peer_instance, sequence, "reloaded note from peer activity");
            }
        }
    }

    async fn retry_pending(&self, sd_id: SdId) {
        let entries: Vec<(PendingKey, RetryState)> = self
            .pending
            .lock()
            .await
            .iter()
            .filter(|((sd, _, _), _)| *sd == sd_id)
            .map(|(k, v)| (*k, *v))
            .collect();
        for ((_, note_id, instance), state) in entries {
            self.try_apply(sd_id, note_id, instance, state.sequence).await;
        }
    }

    pub async fn stale_entries(&self) -> Vec<StaleSyncEntry> {
        self.stale
            .lock()
            .await
            .iter()
            .map(|((sd_id, note_id, instance_id), state)| StaleSyncEntry {
                sd_id: *sd_id,
                note_id: *note_id,
                instance_id: *instance_id,
                sequence: state.sequence,
                attempts: state.attempts,
            })
            .collect()
    }

    /// Reset a stale entry's retry budget so the next sync pass tries again.
    pub async fn retry_stale_entry(&self, sd_id: SdId, note_id: NoteId, instance_id: InstanceId) {
        let key = (sd_id, note_id, instance_id);
        if let Some(state) = self.stale.lock().await.remove(&key) {
            self.pending.lock().await.insert(key, RetryState { sequence: state.sequence, attempts: 0 });
        }
    }

    /// Drop a stale entry permanently; it will not be retried.
    pub async fn skip_stale_entry(&self, sd_id: SdId, note_id: NoteId, instance_id: InstanceId) {
        let key = (sd_id, note_id, instance_id);
        self.stale.lock().await.remove(&key);
        self.pending.lock().await.remove(&key);
    }
}
