//! Comment Observer: diffs a note's comment sub-structures across applies
//! and emits debounced, typed events for remote changes only.

use crate::document::{CommentSnapshot, NoteDocument};
use crate::events::{CommentEvent, CommentEventKind, EventBus};
use crate::ids::NoteId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DebounceKey {
    note_id: NoteId,
    family: &'static str,
    thread_id: String,
    sub_id: Option<String>,
}

struct PendingEvent {
    event: CommentEvent,
    deadline: Instant,
}

/// Owned by the CRDT Manager (or its caller) per loaded note lifetime;
/// called with a fresh `CommentSnapshot` after every `apply_update`.
pub struct CommentObserver {
    event_bus: Arc<EventBus>,
    debounce: Duration,
    last_snapshot: Mutex<HashMap<NoteId, CommentSnapshot>>,
    pending: Mutex<HashMap<DebounceKey, PendingEvent>>,
}

fn split_composite(key: &str) -> (String, Option<String>) {
    match key.split_once(':') {
        Some((thread, sub)) => (thread.to_string(), Some(sub.to_string())),
        None => (key.to_string(), None),
    }
}

impl CommentObserver {
    pub fn new(event_bus: Arc<EventBus>, debounce: Duration) -> Self {
        Self { event_bus, debounce, last_snapshot: Mutex::new(HashMap::new()), pending: Mutex::new(HashMap::new()) }
    }

    /// Diff `doc`'s current comment state against the last observed
    /// snapshot for this note and queue debounced events for every change.
    /// `is_remote` should be `true` only when the triggering apply came from
    /// a peer (Origin::Reload/Load), never from the local editor.
    pub async fn observe(&self, doc: &NoteDocument, is_remote: bool, now_ms: f64) {
        let note_id = doc.note_id();
        let fresh = doc.comment_snapshot();
        let mut snapshots = self.last_snapshot.lock().await;
        let previous = snapshots.insert(note_id, fresh.clone()).unwrap_or_default();
        drop(snapshots);

        self.diff_family(note_id, "thread", &previous.threads, &fresh.threads, is_remote, now_ms).await;
        self.diff_family(note_id, "reply", &previous.replies, &fresh.replies, is_remote, now_ms).await;
        self.diff_family(note_id, "reaction", &previous.reactions, &fresh.reactions, is_remote, now_ms).await;
    }

    async fn diff_family(
        &self,
        note_id: NoteId,
        family: &'static str,
        previous: &HashMap<String, String>,
        fresh: &HashMap<String, String>,
        is_remote: bool,
        now_ms: f64,
    ) {
        for (key, value) in fresh {
            let kind = match (family, previous.get(key)) {
                ("thread", None) => CommentEventKind::ThreadAdd,
                ("thread", Some(old)) if old != value => CommentEventKind::ThreadUpdate,
                ("thread", _) => continue,
                ("reply", None) => CommentEventKind::ReplyAdd,
                ("reply", Some(old)) if old != value => CommentEventKind::ReplyUpdate,
                ("reply", _) => continue,
                ("reaction", None) => CommentEventKind::ReactionAdd,
                ("reaction", Some(old)) if old != value => CommentEventKind::ReactionUpdate,
                _ => continue,
            };
            self.queue(note_id, family, key, kind, is_remote, now_ms).await;
        }
        for key in previous.keys() {
            if fresh.contains_key(key) {
                continue;
            }
            let kind = match family {
                "thread" => CommentEventKind::ThreadDelete,
                "reply" => CommentEventKind::ReplyDelete,
                _ => CommentEventKind::ReactionDelete,
            };
            self.queue(note_id, family, key, kind, is_remote, now_ms).await;
        }
    }

    async fn queue(&self, note_id: NoteId, family: &'static str, key: &str, kind: CommentEventKind, is_remote: bool, now_ms: f64) {
        if !is_remote {
            return;
        }
        let (thread_id, sub_id) = split_composite(key);
        let debounce_key = DebounceKey { note_id, family, thread_id: thread_id.clone(), sub_id: sub_id.clone() };
        let event = CommentEvent {
            note_id,
            kind,
            thread_id,
            reply_id: if family == "reply" { sub_id.clone() } else { None },
            reaction_id: if family == "reaction" { sub_id } else { None },
            is_remote,
            timestamp: now_ms,
        };
        self.pending.lock().await.insert(debounce_key, PendingEvent { event, deadline: Instant::now() + self.debounce });
    }

    /// Flush every pending event whose debounce window has elapsed. The
    /// router calls this on a short interval; events for the same key queued
    /// again before flush simply overwrite the pending entry, coalescing
    /// rapid CRDT merges into a single emission.
    pub async fn flush_due(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock().await;
        let due: Vec<DebounceKey> = pending.iter().filter(|(_, p)| p.deadline <= now).map(|(k, _)| k.clone()).collect();
        for key in due {
            if let Some(p) = pending.remove(&key) {
                self.event_bus.emit(p.event);
            }
        }
    }

    pub async fn forget_note(&self, note_id: NoteId) {
        self.last_snapshot.lock().await.remove(&note_id);
        self.pending.lock().await.retain(|k, _| k.note_id != note_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NoteId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn local_edits_never_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sub = bus.subscribe(move |_| { count_clone.fetch_add(1, Ordering::Relaxed); });

        let observer = CommentObserver::new(bus, Duration::from_millis(1));
        let note_id = NoteId::new();
        let mut doc = NoteDocument::new(note_id);
        doc.upsert_comment_thread("t1", "hello");
        observer.observe(&doc, false, 0.0).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        observer.flush_due().await;

        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn remote_thread_add_is_emitted_after_debounce() {
        let bus = Arc::new(EventBus::new());
        let seen: Arc<std::sync::Mutex<Vec<CommentEvent>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = bus.subscribe(move |e| {
            seen_clone.lock().unwrap().push(e);
        });

        let observer = CommentObserver::new(bus, Duration::from_millis(5));
        let note_id = NoteId::new();
        let mut doc = NoteDocument::new(note_id);
        doc.upsert_comment_thread("t1", "hello");

        observer.observe(&doc, true, 123.0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        observer.flush_due().await;

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].thread_id, "t1");
        assert!(events[0].is_remote);
    }

    #[tokio::test]
    async fn reply_add_carries_its_parent_thread_id() {
        let bus = Arc::new(EventBus::new());
        let seen: Arc<std::sync::Mutex<Vec<CommentEvent>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = bus.subscribe(move |e| {
            seen_clone.lock().unwrap().push(e);
        });

        let observer = CommentObserver::new(bus, Duration::from_millis(1));
        let note_id = NoteId::new();
        let mut doc = NoteDocument::new(note_id);
        doc.upsert_comment_thread("t1", "hello");
        doc.upsert_comment_reply("t1", "r1", "a reply");

        observer.observe(&doc, true, 0.0).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        observer.flush_due().await;

        let events = seen.lock().unwrap();
        let reply_event = events.iter().find(|e| e.kind == CommentEventKind::ReplyAdd).unwrap();
        assert_eq!(reply_event.thread_id, "t1");
        assert_eq!(reply_event.reply_id.as_deref(), Some("r1"));
    }
}
