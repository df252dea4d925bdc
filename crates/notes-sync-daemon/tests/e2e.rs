//! On-disk-layout-sensitive end-to-end tests: these exercise the engine
//! against a real native filesystem under a `tempfile::TempDir` rather
//! than the in-memory double the core crate's unit tests use, to catch
//! path/rename/fsync bugs an in-memory filesystem can't.

use notes_sync_core::sd_router::ConflictResolution;
use notes_sync_core::{
    ActivityLogger, AppendLogManager, CrdtManager, EngineConfig, FileSystem, InMemoryMetadataCache, InstanceId,
    NoteDocument, NoteId, SdId, SdRouter,
};
use notes_sync_daemon::NativeFs;
use std::sync::Arc;
use tempfile::TempDir;

fn fs_at(dir: &TempDir) -> Arc<NativeFs> {
    Arc::new(NativeFs::new(dir.path().to_path_buf()))
}

/// S1: a note with a pre-existing snapshot plus an unpacked tail loads to
/// a doc that reflects every update, snapshot and tail alike.
#[tokio::test]
async fn cold_load_replays_snapshot_then_tail() {
    let dir = TempDir::new().unwrap();
    let fs = fs_at(&dir);
    let instance = InstanceId::new();
    let mgr = AppendLogManager::new(fs.clone(), "sd", SdId::new(), instance, EngineConfig::for_tests());
    let note_id = NoteId::new();

    let mut doc = NoteDocument::new(note_id);
    doc.set_title("v1");
    mgr.write_note_update(note_id, &doc.export_update(None)).await.unwrap();
    let (loaded, vc) = mgr.load_note(note_id).await.unwrap();
    mgr.save_note_snapshot(note_id, &loaded, &vc, 1).await.unwrap();

    let mut doc2 = NoteDocument::from_state(note_id, &loaded.export_snapshot()).unwrap();
    doc2.set_title("v2");
    let tail_update = doc2.export_update(Some(&loaded.state_vector()));
    mgr.write_note_update(note_id, &tail_update).await.unwrap();

    let (reloaded, reloaded_vc) = mgr.load_note(note_id).await.unwrap();
    assert_eq!(reloaded.metadata().title.as_deref(), Some("v2"));
    assert_eq!(reloaded_vc.sequence_for(instance), Some(1));
}

/// Five tasks fire 40 updates each in parallel on the same note; the
/// resulting per-instance sequence run must still be exactly contiguous.
#[tokio::test]
async fn rapid_fire_concurrent_writes_stay_contiguous() {
    let dir = TempDir::new().unwrap();
    let fs = fs_at(&dir);
    let instance = InstanceId::new();
    let mgr = Arc::new(AppendLogManager::new(fs.clone(), "sd", SdId::new(), instance, EngineConfig::for_tests()));
    let note_id = NoteId::new();

    let mut handles = Vec::new();
    for worker in 0..5 {
        let mgr = mgr.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..40u32 {
                let mut doc = NoteDocument::new(note_id);
                doc.set_title(&format!("worker{worker}-{i}"));
                let payload = doc.export_update(None);
                mgr.write_note_update(note_id, &payload).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let (_doc, vc) = mgr.load_note(note_id).await.unwrap();
    assert_eq!(vc.sequence_for(instance), Some(199));
}

/// S5: a corrupted newest snapshot is skipped in favor of the
/// next-best candidate, and loading still reaches the same content a
/// full log replay would produce.
#[tokio::test]
async fn corrupt_newest_snapshot_falls_back_to_the_prior_one() {
    let dir = TempDir::new().unwrap();
    let fs = fs_at(&dir);
    let instance = InstanceId::new();
    let mgr = AppendLogManager::new(fs.clone(), "sd", SdId::new(), instance, EngineConfig::for_tests());
    let note_id = NoteId::new();

    let mut doc = NoteDocument::new(note_id);
    doc.set_title("good snapshot");
    mgr.write_note_update(note_id, &doc.export_update(None)).await.unwrap();
    let (loaded, vc) = mgr.load_note(note_id).await.unwrap();
    mgr.save_note_snapshot(note_id, &loaded, &vc, 1).await.unwrap();

    // A later, newer-timestamped snapshot that is pure garbage.
    let bad_path = format!("sd/notes/{note_id}/snapshots/9999999999-2.snapshot");
    fs.write(&bad_path, b"not a snapshot").await.unwrap();

    let (recovered, _vc) = mgr.load_note(note_id).await.unwrap();
    assert_eq!(recovered.metadata().title.as_deref(), Some("good snapshot"));
}

/// GC safety: after packing and GC, the note's CRDT state is unchanged.
#[tokio::test]
async fn gc_preserves_doc_state() {
    let dir = TempDir::new().unwrap();
    let fs = fs_at(&dir);
    let instance = InstanceId::new();
    let mut config = EngineConfig::for_tests();
    config.min_pack_run_len = 2;
    config.pack_tail_reserve = 0;
    config.gc_retained_snapshots = 1;
    let mgr = AppendLogManager::new(fs.clone(), "sd", SdId::new(), instance, config);
    let note_id = NoteId::new();

    for i in 0..5u8 {
        let mut doc = NoteDocument::new(note_id);
        doc.set_title(&format!("rev{i}"));
        mgr.write_note_update(note_id, &doc.export_update(None)).await.unwrap();
    }
    let (snap1_doc, snap1_vc) = mgr.load_note(note_id).await.unwrap();
    mgr.save_note_snapshot(note_id, &snap1_doc, &snap1_vc, 5).await.unwrap();

    for i in 5..8u8 {
        let mut doc = NoteDocument::from_state(note_id, &snap1_doc.export_snapshot()).unwrap();
        doc.set_title(&format!("rev{i}"));
        let update = doc.export_update(Some(&snap1_doc.state_vector()));
        mgr.write_note_update(note_id, &update).await.unwrap();
    }

    let (before, vc) = mgr.load_note(note_id).await.unwrap();
    mgr.save_note_snapshot(note_id, &before, &vc, 8).await.unwrap();

    let activity = ActivityLogger::new(fs.clone(), "sd", instance);
    mgr.gc_note(note_id).await.unwrap();
    let _ = mgr.pack_note_if_eligible(note_id, 0, &activity).await;

    assert!(mgr.list_snapshot_files(note_id).await.unwrap().len() <= 1);

    let (after, _vc) = mgr.load_note(note_id).await.unwrap();
    assert_eq!(after.metadata().title, before.metadata().title);
    assert_eq!(after.to_plain_text(), before.to_plain_text());
}

/// S6: moving a note across storage directories tombstones the source
/// and recreates the content under the target, using real on-disk
/// snapshot/update files rather than the in-memory double.
#[tokio::test]
async fn cross_sd_move_tombstones_source_and_recreates_in_target() {
    let dir = TempDir::new().unwrap();
    let fs = fs_at(&dir);
    let instance = InstanceId::new();
    let metadata_cache = Arc::new(InMemoryMetadataCache::new());
    let crdt_manager = Arc::new(CrdtManager::new(instance, metadata_cache.clone()));
    let router = SdRouter::new(fs.clone(), instance, EngineConfig::for_tests(), crdt_manager, metadata_cache);

    let source = router.open_sd("source").await.unwrap();
    let target = router.open_sd("target").await.unwrap();

    let note_id = NoteId::new();
    let append_log = router.append_log(source).await.unwrap();
    let mut doc = NoteDocument::new(note_id);
    doc.set_title("Cross-SD note");
    append_log.write_note_update(note_id, &doc.export_update(None)).await.unwrap();

    router.move_note(note_id, source, target, 42_000, ConflictResolution::Cancel).await.unwrap();

    let target_log = router.append_log(target).await.unwrap();
    let (moved, _vc) = target_log.load_note(note_id).await.unwrap();
    assert_eq!(moved.metadata().title.as_deref(), Some("Cross-SD note"));

    let (tombstoned, _vc) = append_log.load_note(note_id).await.unwrap();
    assert_eq!(tombstoned.metadata().deleted_at, Some(42_000));
}

/// The daemon's native filesystem write_atomic discipline never leaves a
/// partial file visible under the target path.
#[tokio::test]
async fn native_fs_write_atomic_round_trips_through_real_disk() {
    let dir = TempDir::new().unwrap();
    let fs = NativeFs::new(dir.path().to_path_buf());
    fs.write_atomic("sd/SD_ID", b"abc-123").await.unwrap();
    assert_eq!(fs.read("sd/SD_ID").await.unwrap(), b"abc-123");
}
