//! MetadataCache: the per-installation collaborator that backs note
//! listing/search, cross-SD `sdId` resolution, the Activity Sync offset
//! high-water-mark, and media registration. A real implementation is a
//! SQLite database living outside any storage directory; this crate only
//! defines the trait it must satisfy and ships an in-memory stand-in for
//! tests and for the headless daemon, which has no outer shell to supply
//! a persistent one.

use crate::ids::{FolderId, ImageId, InstanceId, NoteId, SdId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// Denormalized note row kept for listing/search without opening every
/// note's CRDT document. Tag relations are flattened into `tags` rather
/// than modeled as a separate join table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteMetadataRow {
    pub id: NoteId,
    pub sd_id: SdId,
    pub folder_id: Option<FolderId>,
    pub modified: u64,
    pub deleted: bool,
    pub pinned: bool,
    pub title_text: Option<String>,
    pub content_preview: Option<String>,
    pub tags: Vec<String>,
}

/// Opaque persistence collaborator for the engine. Implementations must be
/// `Send + Sync` so it can be shared behind an `Arc` across tasks.
#[async_trait]
pub trait MetadataCache: Send + Sync {
    async fn upsert_note(&self, row: NoteMetadataRow);
    async fn get_note(&self, note_id: NoteId) -> Option<NoteMetadataRow>;
    async fn list_notes(&self, sd_id: Option<SdId>) -> Vec<NoteMetadataRow>;
    async fn remove_note(&self, note_id: NoteId);

    /// Activity Sync's per-peer high-water-mark: the byte offset (or line
    /// count - callers are consistent within themselves) already applied
    /// from `instance_id`'s activity log under `sd_id`.
    async fn get_last_applied_offset(&self, sd_id: SdId, instance_id: InstanceId) -> Option<u64>;
    async fn set_last_applied_offset(&self, sd_id: SdId, instance_id: InstanceId, offset: u64);

    /// Record that `image_id` under `sd_id` is a known media blob. A no-op
    /// if already registered.
    async fn register_media(&self, sd_id: SdId, image_id: ImageId);
    async fn is_media_registered(&self, sd_id: SdId, image_id: &ImageId) -> bool;
}

/// In-memory `MetadataCache` for tests and for the headless daemon, which
/// has no outer shell to wire up a real SQLite-backed one.
#[derive(Default)]
pub struct InMemoryMetadataCache {
    notes: RwLock<HashMap<NoteId, NoteMetadataRow>>,
    offsets: RwLock<HashMap<(SdId, InstanceId), u64>>,
    media: RwLock<HashMap<SdId, std::collections::HashSet<ImageId>>>,
}

impl InMemoryMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataCache for InMemoryMetadataCache {
    async fn upsert_note(&self, row: NoteMetadataRow) {
        self.notes.write().unwrap().insert(row.id, row);
    }

    async fn get_note(&self, note_id: NoteId) -> Option<NoteMetadataRow> {
        self.notes.read().unwrap().get(&note_id).cloned()
    }

    async fn list_notes(&self, sd_id: Option<SdId>) -> Vec<NoteMetadataRow> {
        self.notes
            .read()
            .unwrap()
            .values()
            .filter(|row| sd_id.map_or(true, |sd| row.sd_id == sd))
            .cloned()
            .collect()
    }

    async fn remove_note(&self, note_id: NoteId) {
        self.notes.write().unwrap().remove(&note_id);
    }

    async fn get_last_applied_offset(&self, sd_id: SdId, instance_id: InstanceId) -> Option<u64> {
        self.offsets.read().unwrap().get(&(sd_id, instance_id)).copied()
    }

    async fn set_last_applied_offset(&self, sd_id: SdId, instance_id: InstanceId, offset: u64) {
        self.offsets.write().unwrap().insert((sd_id, instance_id), offset);
    }

    async fn register_media(&self, sd_id: SdId, image_id: ImageId) {
        self.media.write().unwrap().entry(sd_id).or_default().insert(image_id);
    }

    async fn is_media_registered(&self, sd_id: SdId, image_id: &ImageId) -> bool {
        self.media.read().unwrap().get(&sd_id).is_some_and(|set| set.contains(image_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(note_id: NoteId, sd_id: SdId) -> NoteMetadataRow {
        NoteMetadataRow {
            id: note_id,
            sd_id,
            folder_id: None,
            modified: 1000,
            deleted: false,
            pinned: false,
            title_text: Some("Groceries".into()),
            content_preview: Some("milk, eggs".into()),
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let cache = InMemoryMetadataCache::new();
        let note_id = NoteId::new();
        let sd_id = SdId::new();
        cache.upsert_note(sample_row(note_id, sd_id)).await;

        let row = cache.get_note(note_id).await.unwrap();
        assert_eq!(row.title_text.as_deref(), Some("Groceries"));
    }

    #[tokio::test]
    async fn list_notes_filters_by_sd() {
        let cache = InMemoryMetadataCache::new();
        let (sd_a, sd_b) = (SdId::new(), SdId::new());
        cache.upsert_note(sample_row(NoteId::new(), sd_a)).await;
        cache.upsert_note(sample_row(NoteId::new(), sd_b)).await;

        assert_eq!(cache.list_notes(Some(sd_a)).await.len(), 1);
        assert_eq!(cache.list_notes(None).await.len(), 2);
    }

    #[tokio::test]
    async fn remove_note_drops_it() {
        let cache = InMemoryMetadataCache::new();
        let note_id = NoteId::new();
        cache.upsert_note(sample_row(note_id, SdId::new())).await;
        cache.remove_note(note_id).await;
        assert!(cache.get_note(note_id).await.is_none());
    }

    #[tokio::test]
    async fn last_applied_offset_defaults_to_none_then_persists() {
        let cache = InMemoryMetadataCache::new();
        let (sd_id, instance_id) = (SdId::new(), InstanceId::new());
        assert_eq!(cache.get_last_applied_offset(sd_id, instance_id).await, None);
        cache.set_last_applied_offset(sd_id, instance_id, 42).await;
        assert_eq!(cache.get_last_applied_offset(sd_id, instance_id).await, Some(42));
    }

    #[tokio::test]
    async fn media_registration_is_per_sd() {
        let cache = InMemoryMetadataCache::new();
        let (sd_a, sd_b) = (SdId::new(), SdId::new());
        let image: ImageId = "a".repeat(32).parse().unwrap();
        cache.register_media(sd_a, image.clone()).await;
        assert!(cache.is_media_registered(sd_a, &image).await);
        assert!(!cache.is_media_registered(sd_b, &image).await);
    }
}
