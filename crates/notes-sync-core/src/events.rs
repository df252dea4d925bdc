//! Event infrastructure: `CommentEvent` for the Comment Observer plus the
//! `EventBus`/`Subscription` disposer pattern shared by anything that needs
//! to fan out notifications to UI subscribers.

use crate::ids::{NoteId, SdId};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// What changed in a note's comment sub-structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommentEventKind {
    ThreadAdd,
    ThreadUpdate,
    ThreadDelete,
    ReplyAdd,
    ReplyUpdate,
    ReplyDelete,
    ReactionAdd,
    ReactionUpdate,
    ReactionDelete,
}

/// A single comment-sync notification. Only events with `is_remote: true`
/// are broadcast outward; local editor mutations the UI already knows about
/// are never re-announced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentEvent {
    pub note_id: NoteId,
    #[serde(rename = "type")]
    pub kind: CommentEventKind,
    pub thread_id: String,
    pub reply_id: Option<String>,
    pub reaction_id: Option<String>,
    pub is_remote: bool,
    pub timestamp: f64,
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing comment events to subscribers. Thread-safe for
/// use from the async runtime; wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(CommentEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self { callbacks: RwLock::new(Vec::new()), next_id: AtomicUsize::new(0) }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns a `Subscription` that unsubscribes on drop.
    pub fn subscribe(self: &Arc<Self>, callback: impl Fn(CommentEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().unwrap_or_else(|e| e.into_inner()).push((id, Arc::new(callback)));
        Subscription { bus: Arc::downgrade(self), id }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write avoids deadlock if Drop runs during panic unwinding while
        // a read lock is held (e.g. during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: CommentEvent) {
        let callbacks: Vec<_> = self.callbacks.read().unwrap_or_else(|e| e.into_inner()).iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in callbacks {
            callback(event.clone());
        }
    }
}

/// A note's `sdId`/folder moved from `from` to `to` as a result of a
/// cross-storage-directory move.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMovedEvent {
    pub note_id: NoteId,
    pub new_note_id: NoteId,
    pub from: SdId,
    pub to: SdId,
}

/// Top-level notification surface for anything embedding the engine.
/// Distinct from `CommentEvent`/`EventBus` above: comment notifications are
/// folded in as a variant rather than unified into one generic bus, since
/// the comment-sync plumbing already has its own tested fan-out path.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    NoteModified { note_id: NoteId, sd_id: SdId },
    NoteMoved(NoteMovedEvent),
    Comment(CommentEvent),
    ShutdownProgress { notes_remaining: usize },
    ShutdownComplete,
}

/// Subscription handle for `EngineEventBus`; unsubscribes on drop.
pub struct EngineEventSubscription {
    bus: Weak<EngineEventBus>,
    id: usize,
}

impl Drop for EngineEventSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for `EngineEvent`, following the same disposer pattern as
/// `EventBus`.
pub struct EngineEventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(EngineEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EngineEventBus {
    fn default() -> Self {
        Self { callbacks: RwLock::new(Vec::new()), next_id: AtomicUsize::new(0) }
    }
}

impl EngineEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(self: &Arc<Self>, callback: impl Fn(EngineEvent) + Send + Sync + 'static) -> EngineEventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().unwrap_or_else(|e| e.into_inner()).push((id, Arc::new(callback)));
        EngineEventSubscription { bus: Arc::downgrade(self), id }
    }

    fn unsubscribe(&self, id: usize) {
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        let callbacks: Vec<_> = self.callbacks.read().unwrap_or_else(|e| e.into_inner()).iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in callbacks {
            callback(event.clone());
        }
    }
}
