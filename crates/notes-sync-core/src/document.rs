//! `NoteDocument`: the CRDT structure backing a single note.
//!
//! Wraps a [`yrs::Doc`] with an XML fragment named `content` (the rich
//! text, Tiptap/ProseMirror-shaped), a map `metadata` (title, timestamps,
//! pinned flag, sdId, folderId, deletedAt), and three sub-maps for comment
//! threads, replies, and reactions.

use crate::error::CodecError;
use crate::ids::NoteId;
use crate::origin::Origin;
use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, Map, MapRef, Options, ReadTxn, StateVector, Transact, Update, XmlFragmentRef,
};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NoteMetadata {
    pub title: Option<String>,
    pub created_at: Option<u64>,
    pub modified_at: Option<u64>,
    pub pinned: bool,
    pub sd_id: Option<String>,
    pub folder_id: Option<String>,
    pub deleted_at: Option<u64>,
}

pub struct NoteDocument {
    note_id: NoteId,
    doc: Doc,
    content: XmlFragmentRef,
    metadata: MapRef,
    comment_threads: MapRef,
    comment_replies: MapRef,
    comment_reactions: MapRef,
}

impl NoteDocument {
    pub fn new(note_id: NoteId) -> Self {
        let mut options = Options::default();
        options.client_id = rand::random::<u64>().max(1);
        let doc = Doc::with_options(options);
        Self::wire(note_id, doc)
    }

    /// Rebuild a document from a raw CRDT state (a snapshot's `document_state`
    /// or the concatenation of applied updates during a cold load).
    pub fn from_state(note_id: NoteId, state: &[u8]) -> Result<Self, CodecError> {
        let mut this = Self::new(note_id);
        if !state.is_empty() {
            this.apply_update(state, Origin::Load)?;
        }
        Ok(this)
    }

    fn wire(note_id: NoteId, doc: Doc) -> Self {
        let content = doc.get_or_insert_xml_fragment("content");
        let metadata = doc.get_or_insert_map("metadata");
        let comment_threads = doc.get_or_insert_map("commentThreads");
        let comment_replies = doc.get_or_insert_map("commentReplies");
        let comment_reactions = doc.get_or_insert_map("commentReactions");
        Self { note_id, doc, content, metadata, comment_threads, comment_replies, comment_reactions }
    }

    pub fn note_id(&self) -> NoteId {
        self.note_id
    }

    pub fn content(&self) -> &XmlFragmentRef {
        &self.content
    }

    pub fn comment_threads(&self) -> &MapRef {
        &self.comment_threads
    }

    pub fn comment_replies(&self) -> &MapRef {
        &self.comment_replies
    }

    pub fn comment_reactions(&self) -> &MapRef {
        &self.comment_reactions
    }

    /// Apply a CRDT update produced by this or another instance. `origin`
    /// never changes merge semantics (the CRDT is origin-agnostic) but
    /// callers use it to decide whether to re-persist or re-broadcast.
    pub fn apply_update(&mut self, update: &[u8], _origin: Origin) -> Result<(), CodecError> {
        let update = Update::decode_v1(update).map_err(|e| CodecError::Crdt(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|e| CodecError::Crdt(e.to_string()))?;
        Ok(())
    }

    /// Encode every change since `state_vector` (pass `None` for "since the
    /// beginning", i.e. what `writeNoteUpdate` persists for a local edit).
    pub fn export_update(&self, state_vector: Option<&StateVector>) -> Vec<u8> {
        let txn = self.doc.transact();
        match state_vector {
            Some(sv) => txn.encode_diff_v1(sv),
            None => txn.encode_state_as_update_v1(&StateVector::default()),
        }
    }

    /// Full document state, suitable for a snapshot's `document_state` field.
    pub fn export_snapshot(&self) -> Vec<u8> {
        self.export_update(None)
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    pub fn metadata(&self) -> NoteMetadata {
        let txn = self.doc.transact();
        NoteMetadata {
            title: self.metadata.get(&txn, "title").map(|v| v.to_string(&txn)),
            created_at: self
                .metadata
                .get(&txn, "createdAt")
                .and_then(|v| v.to_string(&txn).parse().ok()),
            modified_at: self
                .metadata
                .get(&txn, "modifiedAt")
                .and_then(|v| v.to_string(&txn).parse().ok()),
            pinned: self
                .metadata
                .get(&txn, "pinned")
                .map(|v| v.to_string(&txn) == "true")
                .unwrap_or(false),
            sd_id: self.metadata.get(&txn, "sdId").map(|v| v.to_string(&txn)),
            folder_id: self.metadata.get(&txn, "folderId").map(|v| v.to_string(&txn)),
            deleted_at: self
                .metadata
                .get(&txn, "deletedAt")
                .and_then(|v| v.to_string(&txn).parse().ok()),
        }
    }

    /// Bump `modifiedAt`; called on every local `applyUpdate` unless the
    /// caller opts out with `skipTimestampUpdate`.
    pub fn touch_modified(&mut self, timestamp_ms: u64) {
        let mut txn = self.doc.transact_mut();
        self.metadata.insert(&mut txn, "modifiedAt", timestamp_ms.to_string());
    }

    pub fn set_title(&mut self, title: &str) {
        let mut txn = self.doc.transact_mut();
        self.metadata.insert(&mut txn, "title", title.to_string());
    }

    pub fn mark_deleted(&mut self, timestamp_ms: u64) {
        let mut txn = self.doc.transact_mut();
        self.metadata.insert(&mut txn, "deletedAt", timestamp_ms.to_string());
    }

    pub fn set_sd_and_folder(&mut self, sd_id: &str, folder_id: Option<&str>) {
        let mut txn = self.doc.transact_mut();
        self.metadata.insert(&mut txn, "sdId", sd_id.to_string());
        if let Some(folder_id) = folder_id {
            self.metadata.insert(&mut txn, "folderId", folder_id.to_string());
        }
    }

    /// Plain-text rendering of the rich-text content, used for the
    /// MetadataCache's search preview and for computing a content hash.
    pub fn to_plain_text(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    pub fn upsert_comment_thread(&mut self, thread_id: &str, content: &str) {
        let mut txn = self.doc.transact_mut();
        self.comment_threads.insert(&mut txn, thread_id, content.to_string());
    }

    pub fn delete_comment_thread(&mut self, thread_id: &str) {
        let mut txn = self.doc.transact_mut();
        self.comment_threads.remove(&mut txn, thread_id);
    }

    pub fn upsert_comment_reply(&mut self, thread_id: &str, reply_id: &str, content: &str) {
        let mut txn = self.doc.transact_mut();
        self.comment_replies.insert(&mut txn, format!("{thread_id}:{reply_id}"), content.to_string());
    }

    pub fn delete_comment_reply(&mut self, thread_id: &str, reply_id: &str) {
        let mut txn = self.doc.transact_mut();
        self.comment_replies.remove(&mut txn, &format!("{thread_id}:{reply_id}"));
    }

    pub fn upsert_comment_reaction(&mut self, thread_id: &str, reaction_id: &str, content: &str) {
        let mut txn = self.doc.transact_mut();
        self.comment_reactions.insert(&mut txn, format!("{thread_id}:{reaction_id}"), content.to_string());
    }

    pub fn delete_comment_reaction(&mut self, thread_id: &str, reaction_id: &str) {
        let mut txn = self.doc.transact_mut();
        self.comment_reactions.remove(&mut txn, &format!("{thread_id}:{reaction_id}"));
    }

    /// Flat id -> content-string snapshot of the three comment maps, for the
    /// Comment Observer to diff between applies. Reply and reaction keys are
    /// `<threadId>:<entryId>`; thread keys are bare thread ids.
    pub fn comment_snapshot(&self) -> CommentSnapshot {
        let txn = self.doc.transact();
        let dump = |map: &MapRef| -> std::collections::HashMap<String, String> {
            map.iter(&txn).map(|(k, v)| (k.to_string(), v.to_string(&txn))).collect()
        };
        CommentSnapshot {
            threads: dump(&self.comment_threads),
            replies: dump(&self.comment_replies),
            reactions: dump(&self.comment_reactions),
        }
    }
}

/// Id -> content-string snapshot of a note's comment sub-structures, used to
/// detect adds/updates/deletes between two points in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommentSnapshot {
    pub threads: std::collections::HashMap<String, String>,
    pub replies: std::collections::HashMap<String, String>,
    pub reactions: std::collections::HashMap<String, String>,
}
