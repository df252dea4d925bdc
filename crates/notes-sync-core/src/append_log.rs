//! Append-Log Manager: owns one SD's on-disk layout for notes and the
//! folder tree - writing updates, creating snapshots/packs, and cold-loading
//! documents by replaying the smallest sufficient set of files.

use crate::activity::ActivityLogger;
use crate::codec::{pack, snapshot, update_log};
use crate::config::EngineConfig;
use crate::document::NoteDocument;
use crate::error::{CodecError, FsError};
use crate::folder_tree::FolderTreeDocument;
use crate::fs::FileSystem;
use crate::ids::{InstanceId, NoteId, SdId};
use crate::origin::Origin;
use crate::vector_clock::VectorClock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default)]
struct WriteState {
    next_sequence: u64,
    file_index: u32,
    file_size: u64,
}

/// Coordinates written by a successful `writeNoteUpdate`/`writeFolderUpdate`.
#[derive(Debug, Clone)]
pub struct WriteCoordinates {
    pub sequence: u64,
    pub offset: u64,
    pub file: String,
}

pub struct AppendLogManager {
    fs: Arc<dyn FileSystem>,
    sd_root: String,
    sd_id: SdId,
    instance_id: InstanceId,
    config: EngineConfig,
    note_write_state: Mutex<HashMap<NoteId, WriteState>>,
    folder_write_state: Mutex<Option<WriteState>>,
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

impl AppendLogManager {
    pub fn new(fs: Arc<dyn FileSystem>, sd_root: impl Into<String>, sd_id: SdId, instance_id: InstanceId, config: EngineConfig) -> Self {
        Self {
            fs,
            sd_root: sd_root.into(),
            sd_id,
            instance_id,
            config,
            note_write_state: Mutex::new(HashMap::new()),
            folder_write_state: Mutex::new(None),
        }
    }

    fn note_updates_dir(&self, note_id: NoteId) -> String {
        format!("{}/notes/{note_id}/updates", self.sd_root)
    }
    fn note_packs_dir(&self, note_id: NoteId) -> String {
        format!("{}/notes/{note_id}/packs", self.sd_root)
    }
    fn note_snapshots_dir(&self, note_id: NoteId) -> String {
        format!("{}/notes/{note_id}/snapshots", self.sd_root)
    }
    fn folder_updates_dir(&self) -> String {
        format!("{}/folders/updates", self.sd_root)
    }
    fn folder_packs_dir(&self) -> String {
        format!("{}/folders/packs", self.sd_root)
    }
    fn folder_snapshots_dir(&self) -> String {
        format!("{}/folders/snapshots", self.sd_root)
    }

    pub async fn list_notes(&self) -> crate::fs::Result<Vec<NoteId>> {
        let dir = format!("{}/notes", self.sd_root);
        let entries = match self.fs.list(&dir).await {
            Ok(e) => e,
            Err(FsError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(entries
            .into_iter()
            .filter(|e| e.is_dir)
            .filter_map(|e| e.name.parse().ok())
            .collect())
    }

    async fn list_dir_names(&self, dir: &str) -> crate::fs::Result<Vec<String>> {
        match self.fs.list(dir).await {
            Ok(entries) => Ok(entries.into_iter().filter(|e| !e.is_dir).map(|e| e.name).collect()),
            Err(FsError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_update_files(&self, note_id: NoteId) -> crate::fs::Result<Vec<String>> {
        self.list_dir_names(&self.note_updates_dir(note_id)).await
    }

    pub async fn list_pack_files(&self, note_id: NoteId) -> crate::fs::Result<Vec<String>> {
        self.list_dir_names(&self.note_packs_dir(note_id)).await
    }

    pub async fn list_snapshot_files(&self, note_id: NoteId) -> crate::fs::Result<Vec<String>> {
        self.list_dir_names(&self.note_snapshots_dir(note_id)).await
    }

    /// Append one finalized record to `dir/<instance>_<fileIndex>.crdtlog`,
    /// rotating to a new file index when the current one would exceed the
    /// configured size threshold. Returns the write coordinates and the
    /// write state to persist for the next call.
    async fn append_record(
        &self,
        dir: &str,
        state: WriteState,
        payload: &[u8],
    ) -> crate::fs::Result<(WriteCoordinates, WriteState)> {
        let sequence = state.next_sequence;
        let record = update_log::UpdateRecord { timestamp: now_ms(), sequence, payload: payload.to_vec() };
        let encoded = update_log::encode_record(&record);

        let (file_index, file_size) = if state.file_size + encoded.len() as u64 > self.config.update_log_rotate_bytes
            && state.file_size > 0
        {
            (state.file_index + 1, 0)
        } else {
            (state.file_index, state.file_size)
        };

        let filename = update_log::crdtlog_filename(&self.instance_id.to_string(), file_index);
        let path = format!("{dir}/{filename}");
        let offset = file_size;

        self.fs.append(&path, &encoded).await?;
        self.fs.patch_byte(&path, offset, update_log::STATUS_READY).await?;

        let new_state = WriteState { next_sequence: sequence + 1, file_index, file_size: file_size + encoded.len() as u64 };
        Ok((WriteCoordinates { sequence, offset, file: filename }, new_state))
    }

    async fn ensure_note_write_state(&self, note_id: NoteId, guard: &mut HashMap<NoteId, WriteState>) -> crate::fs::Result<()> {
        if guard.contains_key(&note_id) {
            return Ok(());
        }
        let (_doc, vc) = self.load_note_internal(note_id).await?;
        let next_sequence = vc.sequence_for(self.instance_id).map(|s| s + 1).unwrap_or(0);

        let files = self.list_update_files(note_id).await?;
        let file_index = files
            .iter()
            .filter_map(|f| update_log::parse_crdtlog_filename(f))
            .filter(|(instance, _)| instance == &self.instance_id.to_string())
            .map(|(_, idx)| idx)
            .max()
            .unwrap_or(0);
        let dir = self.note_updates_dir(note_id);
        let filename = update_log::crdtlog_filename(&self.instance_id.to_string(), file_index);
        let file_size = self.fs.stat(&format!("{dir}/{filename}")).await.map(|s| s.size).unwrap_or(0);

        guard.insert(note_id, WriteState { next_sequence, file_index, file_size });
        Ok(())
    }

    pub async fn write_note_update(&self, note_id: NoteId, payload: &[u8]) -> crate::fs::Result<WriteCoordinates> {
        let mut guard = self.note_write_state.lock().await;
        self.ensure_note_write_state(note_id, &mut guard).await?;
        let state = *guard.get(&note_id).unwrap();
        let dir = self.note_updates_dir(note_id);
        let (coords, new_state) = self.append_record(&dir, state, payload).await?;
        guard.insert(note_id, new_state);
        Ok(coords)
    }

    pub async fn write_folder_update(&self, payload: &[u8]) -> crate::fs::Result<WriteCoordinates> {
        let mut guard = self.folder_write_state.lock().await;
        if guard.is_none() {
            let (_doc, vc) = self.load_folder_tree_internal().await?;
            let next_sequence = vc.sequence_for(self.instance_id).map(|s| s + 1).unwrap_or(0);
            let files = self.list_dir_names(&self.folder_updates_dir()).await?;
            let file_index = files
                .iter()
                .filter_map(|f| update_log::parse_crdtlog_filename(f))
                .filter(|(instance, _)| instance == &self.instance_id.to_string())
                .map(|(_, idx)| idx)
                .max()
                .unwrap_or(0);
            let dir = self.folder_updates_dir();
            let filename = update_log::crdtlog_filename(&self.instance_id.to_string(), file_index);
            let file_size = self.fs.stat(&format!("{dir}/{filename}")).await.map(|s| s.size).unwrap_or(0);
            *guard = Some(WriteState { next_sequence, file_index, file_size });
        }
        let state = guard.unwrap();
        let dir = self.folder_updates_dir();
        let (coords, new_state) = self.append_record(&dir, state, payload).await?;
        *guard = Some(new_state);
        Ok(coords)
    }

    /// Read every `.crdtlog`/legacy-`.yjson` update file in `dir`, grouped
    /// by instance, as `(instance, timestamp, sequence, payload)` tuples.
    /// Corrupt files are skipped with a warning, never abort the load - but
    /// a skipped file leaves a hole in its instance's sequence run, which
    /// callers that require contiguity (packing) must detect themselves.
    async fn read_update_files(&self, dir: &str) -> crate::fs::Result<Vec<(String, u64, u64, Vec<u8>)>> {
        let mut out = Vec::new();
        for name in self.list_dir_names(dir).await? {
            let path = format!("{dir}/{name}");
            if let Some((instance, _file_index)) = update_log::parse_crdtlog_filename(&name) {
                let bytes = match self.fs.read(&path).await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(file = %path, error = %e, "failed to read update file, skipping");
                        continue;
                    }
                };
                let (records, _visible_tail) = update_log::decode_records(&bytes);
                for record in records {
                    out.push((instance.clone(), record.timestamp, record.sequence, record.payload));
                }
            } else if let Some((instance, sequence)) = update_log::parse_legacy_yjson_filename(&name) {
                match self.fs.read(&path).await {
                    Ok(payload) => out.push((instance, 0, sequence, payload)),
                    Err(e) => warn!(file = %path, error = %e, "failed to read legacy update file, skipping"),
                }
            }
        }
        Ok(out)
    }

    async fn read_pack_files(&self, dir: &str) -> crate::fs::Result<Vec<pack::Pack>> {
        let mut out = Vec::new();
        for name in self.list_dir_names(dir).await? {
            let path = format!("{dir}/{name}");
            let bytes = match self.fs.read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(file = %path, error = %e, "failed to read pack file, skipping");
                    continue;
                }
            };
            let decoded = if name.ends_with(".zst") {
                pack::decompress(&bytes).and_then(|raw| pack::decode(&raw))
            } else {
                pack::decode(&bytes)
            };
            match decoded {
                Ok(p) => out.push(p),
                Err(e) => warn!(file = %path, error = %e, "failed to decode pack file, skipping"),
            }
        }
        Ok(out)
    }

    /// Try every candidate snapshot, newest first, falling back on decode
    /// failure. Returns `None` if no snapshot decodes (full replay needed).
    async fn best_snapshot(&self, dir: &str) -> crate::fs::Result<Option<snapshot::Snapshot>> {
        let names = self.list_dir_names(dir).await?;
        for name in snapshot::rank_candidates(names) {
            let path = format!("{dir}/{name}");
            match self.fs.read(&path).await {
                Ok(bytes) => match snapshot::decode(&bytes) {
                    Ok(snap) => return Ok(Some(snap)),
                    Err(e) => {
                        warn!(file = %path, error = %e, "snapshot failed to decode, trying next candidate");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(file = %path, error = %e, "failed to read snapshot file, trying next candidate");
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Apply packs and raw update files on top of a base vector clock,
    /// returning the CRDT update payloads that still need applying plus the
    /// resulting vector clock.
    async fn replay_tail(
        &self,
        updates_dir: &str,
        packs_dir: &str,
        mut vc: VectorClock,
    ) -> crate::fs::Result<(Vec<Vec<u8>>, VectorClock)> {
        let mut payloads = Vec::new();

        for p in self.read_pack_files(packs_dir).await? {
            let Ok(instance): Result<InstanceId, _> = p.instance.parse() else { continue };
            for entry in &p.entries {
                if !vc.has_absorbed(instance, entry.sequence) {
                    payloads.push((entry.sequence, entry.payload.clone()));
                }
            }
            vc.advance(instance, p.end_seq, 0, "pack");
        }

        let mut raw_entries = Vec::new();
        for (instance_str, _timestamp, sequence, payload) in self.read_update_files(updates_dir).await? {
            let Ok(instance): Result<InstanceId, _> = instance_str.parse() else { continue };
            if !vc.has_absorbed(instance, sequence) {
                raw_entries.push((instance, sequence, payload));
            }
        }
        // Apply in ascending sequence order for deterministic, reproducible replay.
        raw_entries.sort_by_key(|(_, seq, _)| *seq);
        for (instance, sequence, payload) in raw_entries {
            payloads.sort_by_key(|(seq, _)| *seq);
            vc.advance(instance, sequence, 0, "update");
            payloads.push((sequence, payload));
        }
        payloads.sort_by_key(|(seq, _)| *seq);

        Ok((payloads.into_iter().map(|(_, payload)| payload).collect(), vc))
    }

    async fn load_note_internal(&self, note_id: NoteId) -> crate::fs::Result<(NoteDocument, VectorClock)> {
        let snapshots_dir = self.note_snapshots_dir(note_id);
        let updates_dir = self.note_updates_dir(note_id);
        let packs_dir = self.note_packs_dir(note_id);

        let (mut doc, base_vc) = match self.best_snapshot(&snapshots_dir).await? {
            Some(snap) => {
                let doc = NoteDocument::from_state(note_id, &snap.document_state)
                    .unwrap_or_else(|_| NoteDocument::new(note_id));
                (doc, snap.vector_clock)
            }
            None => (NoteDocument::new(note_id), VectorClock::new()),
        };

        let (payloads, vc) = self.replay_tail(&updates_dir, &packs_dir, base_vc).await?;
        for payload in payloads {
            if let Err(e) = doc.apply_update(&payload, Origin::Load) {
                warn!(note = %note_id, error = %e, "failed to apply update during load, skipping");
            }
        }

        Ok((doc, vc))
    }

    pub async fn load_note(&self, note_id: NoteId) -> crate::fs::Result<(NoteDocument, VectorClock)> {
        debug!(sd = %self.sd_root, note = %note_id, "loading note");
        self.load_note_internal(note_id).await
    }

    async fn load_folder_tree_internal(&self) -> crate::fs::Result<(FolderTreeDocument, VectorClock)> {
        let snapshots_dir = self.folder_snapshots_dir();
        let updates_dir = self.folder_updates_dir();
        let packs_dir = self.folder_packs_dir();

        let (mut doc, base_vc) = match self.best_snapshot(&snapshots_dir).await? {
            Some(snap) => {
                let doc = FolderTreeDocument::from_state(self.sd_id, &snap.document_state)
                    .unwrap_or_else(|_| FolderTreeDocument::new(self.sd_id));
                (doc, snap.vector_clock)
            }
            None => (FolderTreeDocument::new(self.sd_id), VectorClock::new()),
        };

        let (payloads, vc) = self.replay_tail(&updates_dir, &packs_dir, base_vc).await?;
        for payload in payloads {
            if let Err(e) = doc.apply_update(&payload, Origin::Load) {
                warn!(error = %e, "failed to apply folder update during load, skipping");
            }
        }

        Ok((doc, vc))
    }

    pub async fn load_folder_tree(&self) -> crate::fs::Result<(FolderTreeDocument, VectorClock)> {
        debug!(sd = %self.sd_id, "loading folder tree");
        self.load_folder_tree_internal().await
    }

    pub async fn save_note_snapshot(&self, note_id: NoteId, doc: &NoteDocument, vc: &VectorClock, total_changes: u64) -> crate::fs::Result<()> {
        let snap = snapshot::Snapshot {
            created_at: now_ms(),
            total_changes,
            vector_clock: vc.clone(),
            document_state: doc.export_snapshot(),
        };
        let encoded = snapshot::encode(&snap).map_err(codec_to_fs_err)?;
        let filename = snapshot::snapshot_filename(snap.created_at, snap.total_changes);
        let path = format!("{}/{filename}", self.note_snapshots_dir(note_id));
        self.fs.write_atomic(&path, &encoded).await
    }

    /// Longest prefix of `entries` (sorted by sequence) that is both aged
    /// past `min_age_ms` and contiguous with no missing sequence. Stops at
    /// the first record that fails either test - a pack built across a gap
    /// would let the vector clock claim absorption of sequences it never
    /// actually covered.
    fn eligible_run_len(entries: &[(u64, u64, Vec<u8>)], now_ms_value: u64, min_age_ms: u64) -> usize {
        let mut expected_seq = None;
        let mut run_len = 0;
        for (timestamp, seq, _) in entries {
            if now_ms_value.saturating_sub(*timestamp) < min_age_ms {
                break;
            }
            if let Some(expected) = expected_seq {
                if *seq != expected {
                    break;
                }
            }
            expected_seq = Some(seq + 1);
            run_len += 1;
        }
        run_len
    }

    /// Packing scheduler pass for one note: if there are enough old,
    /// contiguous, eligible records for some instance, compact them into a
    /// pack and leave the source update files for GC to remove later.
    pub async fn pack_note_if_eligible(&self, note_id: NoteId, now_ms_value: u64, activity: &ActivityLogger) -> crate::fs::Result<()> {
        let _ = activity; // packing itself emits no activity; only writes do.
        let updates_dir = self.note_updates_dir(note_id);
        let by_instance = self.read_update_files(&updates_dir).await?;
        let mut grouped: HashMap<String, Vec<(u64, u64, Vec<u8>)>> = HashMap::new();
        for (instance, timestamp, seq, payload) in by_instance {
            grouped.entry(instance).or_default().push((timestamp, seq, payload));
        }

        let min_age_ms = self.config.pack_eligibility_age.as_millis() as u64;

        for (instance, mut entries) in grouped {
            entries.sort_by_key(|(_, seq, _)| *seq);
            let run_len = Self::eligible_run_len(&entries, now_ms_value, min_age_ms);
            let eligible_count = run_len.saturating_sub(self.config.pack_tail_reserve);
            if eligible_count < self.config.min_pack_run_len {
                continue;
            }
            let eligible = &entries[..eligible_count];
            let pack_entries: Vec<pack::PackEntry> = eligible
                .iter()
                .map(|(timestamp, seq, payload)| pack::PackEntry { sequence: *seq, timestamp: *timestamp, payload: payload.clone() })
                .collect();
            let built = pack::Pack::from_entries(instance.clone(), pack_entries);
            let encoded = pack::encode(&built);
            let compressed = pack::compress(&encoded).map_err(codec_to_fs_err)?;
            let filename = pack::pack_filename(&instance, built.start_seq, built.end_seq, true);
            let path = format!("{}/{filename}", self.note_packs_dir(note_id));
            self.fs.write_atomic(&path, &compressed).await?;
        }
        Ok(())
    }

    /// GC pass for one note: delete update files and packs fully dominated
    /// by the latest retained snapshot, keeping the most recent snapshots.
    pub async fn gc_note(&self, note_id: NoteId) -> crate::fs::Result<()> {
        let snapshots_dir = self.note_snapshots_dir(note_id);
        let names = snapshot::rank_candidates(self.list_dir_names(&snapshots_dir).await?);
        if names.len() <= self.config.gc_retained_snapshots {
            return Ok(());
        }
        let Some(newest) = names.first() else { return Ok(()) };
        let bytes = self.fs.read(&format!("{snapshots_dir}/{newest}")).await?;
        let Ok(snap) = snapshot::decode(&bytes) else { return Ok(()) };

        let updates_dir = self.note_updates_dir(note_id);
        for name in self.list_dir_names(&updates_dir).await? {
            if let Some((instance, _)) = update_log::parse_crdtlog_filename(&name) {
                let path = format!("{updates_dir}/{name}");
                let Ok(bytes) = self.fs.read(&path).await else { continue };
                let (records, _) = update_log::decode_records(&bytes);
                let Ok(instance_id): Result<InstanceId, _> = instance.parse() else { continue };
                let all_dominated = records.iter().all(|r| snap.vector_clock.has_absorbed(instance_id, r.sequence));
                if all_dominated && !records.is_empty() {
                    self.fs.delete(&path).await?;
                }
            }
        }

        let packs_dir = self.note_packs_dir(note_id);
        for name in self.list_dir_names(&packs_dir).await? {
            let path = format!("{packs_dir}/{name}");
            let Ok(bytes) = self.fs.read(&path).await else { continue };
            let decoded = if name.ends_with(".zst") {
                pack::decompress(&bytes).and_then(|raw| pack::decode(&raw))
            } else {
                pack::decode(&bytes)
            };
            let Ok(p) = decoded else { continue };
            let Ok(instance_id): Result<InstanceId, _> = p.instance.parse() else { continue };
            if snap.vector_clock.has_absorbed(instance_id, p.end_seq) {
                self.fs.delete(&path).await?;
            }
        }

        for old in names.iter().skip(self.config.gc_retained_snapshots) {
            self.fs.delete(&format!("{snapshots_dir}/{old}")).await?;
        }

        Ok(())
    }
}

fn codec_to_fs_err(e: CodecError) -> FsError {
    FsError::IoFatal { path: String::new(), message: e.to_string() }
}
