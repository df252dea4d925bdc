//! notes-sync-core: local-first CRDT notes engine shared between the daemon
//! binary and any outer shell.
//!
//! This crate owns the entire durable sync model for a filesystem-mediated,
//! peer-to-peer note store with no network transport: the on-disk codecs for
//! update logs, packs and snapshots, the per-note CRDT registry, activity-log
//! based cross-instance reconciliation, and storage-directory lifecycle
//! management. Every disk operation goes through the `FileSystem` trait so
//! the whole stack is testable against an in-memory double.

pub mod activity;
pub mod activity_sync;
pub mod append_log;
pub mod codec;
pub mod comment_observer;
pub mod config;
pub mod crdt_manager;
pub mod document;
pub mod engine;
pub mod error;
pub mod events;
pub mod folder_tree;
pub mod fs;
pub mod ids;
pub mod metadata_cache;
pub mod origin;
pub mod sd_router;
pub mod vector_clock;

pub use activity::{ActivityEntry, ActivityLogger};
pub use activity_sync::{ActivitySync, StaleSyncEntry};
pub use append_log::{AppendLogManager, WriteCoordinates};
pub use comment_observer::CommentObserver;
pub use config::EngineConfig;
pub use crdt_manager::CrdtManager;
pub use document::{CommentSnapshot, NoteDocument, NoteMetadata};
pub use engine::{Engine, EngineCommand};
pub use error::{CodecError, EngineError, FsError, Outcome, Result, StorageError};
pub use events::{
    CommentEvent, CommentEventKind, EngineEvent, EngineEventBus, EngineEventSubscription, EventBus, NoteMovedEvent,
    Subscription,
};
pub use folder_tree::{FolderEntry, FolderTreeDocument};
pub use fs::{FileEntry, FileStat, FileSystem, InMemoryFs, RetryingFs};
pub use ids::{FolderId, IdError, ImageId, InstanceId, NoteId, SdId};
pub use metadata_cache::{InMemoryMetadataCache, MetadataCache, NoteMetadataRow};
pub use origin::Origin;
pub use sd_router::SdRouter;
pub use vector_clock::{ClockEntry, VectorClock};
