//! The typed command/event boundary an outer shell (daemon CLI, future IPC
//! server, embedding host) drives the engine through, instead of reaching
//! into `CrdtManager`/`SdRouter`/`ActivitySync` directly. Everything below
//! is a thin dispatcher: the actual work still lives in those three.

use crate::crdt_manager::CrdtManager;
use crate::activity_sync::ActivitySync;
use crate::error::EngineError;
use crate::events::{EngineEvent, EngineEventSubscription, NoteMovedEvent};
use crate::ids::{InstanceId, NoteId, SdId};
use crate::sd_router::{ConflictResolution, SdRouter};
use std::sync::Arc;

/// A request to mutate engine state. `dispatch` maps each variant onto the
/// corresponding `CrdtManager`/`SdRouter`/`ActivitySync` call and, where the
/// spec calls for a notification, emits the matching `EngineEvent`.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    LoadNote { note_id: NoteId, sd_hint: Option<SdId> },
    UnloadNote { note_id: NoteId },
    ApplyUpdate { note_id: NoteId, payload: Vec<u8>, skip_timestamp_update: bool },
    ReloadNote { note_id: NoteId },
    MoveNote { note_id: NoteId, source_sd: SdId, target_sd: SdId, now_ms: u64, conflict_resolution: ConflictResolution },
    RetryStaleSync { sd_id: SdId, note_id: NoteId, instance_id: InstanceId },
    SkipStaleSync { sd_id: SdId, note_id: NoteId, instance_id: InstanceId },
    Shutdown,
}

/// Facade bundling the three managers behind a single `dispatch` entry
/// point and a single `EngineEvent` subscription surface.
pub struct Engine {
    pub crdt_manager: Arc<CrdtManager>,
    pub router: Arc<SdRouter>,
    pub activity_sync: Arc<ActivitySync>,
}

impl Engine {
    pub fn new(crdt_manager: Arc<CrdtManager>, router: Arc<SdRouter>, activity_sync: Arc<ActivitySync>) -> Self {
        Self { crdt_manager, router, activity_sync }
    }

    pub fn subscribe(&self, callback: impl Fn(EngineEvent) + Send + Sync + 'static) -> EngineEventSubscription {
        self.crdt_manager.subscribe(callback)
    }

    pub async fn dispatch(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        match cmd {
            EngineCommand::LoadNote { note_id, sd_hint } => self.crdt_manager.load_note(note_id, sd_hint).await,
            EngineCommand::UnloadNote { note_id } => {
                self.crdt_manager.unload_note(note_id).await;
                Ok(())
            }
            EngineCommand::ApplyUpdate { note_id, payload, skip_timestamp_update } => {
                self.crdt_manager.apply_update(note_id, payload, skip_timestamp_update).await
            }
            EngineCommand::ReloadNote { note_id } => self.crdt_manager.reload_note(note_id).await,
            EngineCommand::MoveNote { note_id, source_sd, target_sd, now_ms, conflict_resolution } => {
                let new_note_id = self.router.move_note(note_id, source_sd, target_sd, now_ms, conflict_resolution).await?;
                self.crdt_manager.events().emit(EngineEvent::NoteMoved(NoteMovedEvent {
                    note_id,
                    new_note_id,
                    from: source_sd,
                    to: target_sd,
                }));
                Ok(())
            }
            EngineCommand::RetryStaleSync { sd_id, note_id, instance_id } => {
                self.activity_sync.retry_stale_entry(sd_id, note_id, instance_id).await;
                Ok(())
            }
            EngineCommand::SkipStaleSync { sd_id, note_id, instance_id } => {
                self.activity_sync.skip_stale_entry(sd_id, note_id, instance_id).await;
                Ok(())
            }
            EngineCommand::Shutdown => {
                let events = self.crdt_manager.events();
                self.crdt_manager
                    .flush_snapshots(|done, total| {
                        events.emit(EngineEvent::ShutdownProgress { notes_remaining: total.saturating_sub(done) });
                    })
                    .await;
                events.emit(EngineEvent::ShutdownComplete);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append_log::AppendLogManager;
    use crate::activity::ActivityLogger;
    use crate::config::EngineConfig;
    use crate::document::NoteDocument;
    use crate::fs::InMemoryFs;
    use crate::metadata_cache::InMemoryMetadataCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn setup() -> (Engine, SdId) {
        let fs = Arc::new(InMemoryFs::new());
        let instance_id = InstanceId::new();
        let sd_id = SdId::new();
        let metadata_cache = Arc::new(InMemoryMetadataCache::new());
        let crdt_manager = Arc::new(CrdtManager::new(instance_id, metadata_cache.clone()));
        let append_log = Arc::new(AppendLogManager::new(fs.clone(), "sd", sd_id, instance_id, EngineConfig::for_tests()));
        let activity = Arc::new(ActivityLogger::new(fs.clone(), "sd", instance_id));
        crdt_manager.register_sd(sd_id, append_log, activity).await;

        let router = Arc::new(SdRouter::new(fs.clone(), instance_id, EngineConfig::for_tests(), crdt_manager.clone(), metadata_cache.clone()));
        let activity_sync = Arc::new(ActivitySync::new(fs, crdt_manager.clone(), instance_id, EngineConfig::for_tests(), metadata_cache));
        (Engine::new(crdt_manager, router, activity_sync), sd_id)
    }

    #[tokio::test]
    async fn load_then_apply_update_round_trips_through_dispatch() {
        let (engine, sd_id) = setup().await;
        let note_id = NoteId::new();
        engine.dispatch(EngineCommand::LoadNote { note_id, sd_hint: Some(sd_id) }).await.unwrap();

        let mut scratch = NoteDocument::new(note_id);
        scratch.set_title("Via dispatch");
        let payload = scratch.export_update(None);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let _sub = engine.subscribe(move |event| {
            if matches!(event, EngineEvent::NoteModified { .. }) {
                seen_clone.fetch_add(1, Ordering::Relaxed);
            }
        });

        engine.dispatch(EngineCommand::ApplyUpdate { note_id, payload, skip_timestamp_update: false }).await.unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn move_note_emits_note_moved() {
        let (engine, source) = setup().await;
        let target = engine.router.open_sd("target").await.unwrap();

        let note_id = NoteId::new();
        engine.dispatch(EngineCommand::LoadNote { note_id, sd_hint: Some(source) }).await.unwrap();
        let mut scratch = NoteDocument::new(note_id);
        scratch.set_title("Movable via dispatch");
        engine
            .dispatch(EngineCommand::ApplyUpdate { note_id, payload: scratch.export_update(None), skip_timestamp_update: true })
            .await
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let _sub = engine.subscribe(move |event| {
            if matches!(event, EngineEvent::NoteMoved(_)) {
                seen_clone.fetch_add(1, Ordering::Relaxed);
            }
        });

        engine
            .dispatch(EngineCommand::MoveNote {
                note_id,
                source_sd: source,
                target_sd: target,
                now_ms: 1,
                conflict_resolution: ConflictResolution::Cancel,
            })
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn shutdown_emits_progress_then_complete() {
        let (engine, _sd_id) = setup().await;
        let seen_complete = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen_complete.clone();
        let _sub = engine.subscribe(move |event| {
            if matches!(event, EngineEvent::ShutdownComplete) {
                seen_clone.fetch_add(1, Ordering::Relaxed);
            }
        });

        engine.dispatch(EngineCommand::Shutdown).await.unwrap();
        assert_eq!(seen_complete.load(Ordering::Relaxed), 1);
    }
}
