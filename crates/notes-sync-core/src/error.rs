//! Typed error chain for the engine: `FsError` -> `CodecError` -> `StorageError` -> `EngineError`.
//!
//! Callers that need to branch on outcome (the SD Router deciding whether to mark
//! an SD unhealthy, the CRDT Manager deciding whether to retry) match on these
//! kinds instead of parsing messages.

use crate::ids::{InstanceId, NoteId, SdId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("transient io error on {path}: {message}")]
    IoTransient { path: String, message: String },

    #[error("fatal io error on {path}: {message}")]
    IoFatal { path: String, message: String },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated record: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("record in progress (status byte 0x00), not visible to readers")]
    InProgress,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("crdt decode error: {0}")]
    Crdt(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("sequence gap for instance {instance} on note {note}: have {have}, need {need}")]
    SequenceGap {
        instance: InstanceId,
        note: NoteId,
        have: u64,
        need: u64,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("note {note} already exists in sd {sd}")]
    CrossSdMoveConflict { note: NoteId, sd: SdId },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("note not found: {0}")]
    NoteNotFound(NoteId),

    #[error("storage directory not found: {0}")]
    SdNotFound(SdId),

    #[error("storage directory unhealthy: {0}")]
    SdUnhealthy(SdId),

    #[error("stale sync entry for note {note} from instance {instance} at sequence {sequence}")]
    StaleSync {
        note: NoteId,
        instance: InstanceId,
        sequence: u64,
    },
}

impl From<FsError> for EngineError {
    fn from(e: FsError) -> Self {
        EngineError::Storage(StorageError::Fs(e))
    }
}

impl From<CodecError> for EngineError {
    fn from(e: CodecError) -> Self {
        EngineError::Storage(StorageError::Codec(e))
    }
}

/// Coarse outcome shown to the outer shell; raw filesystem errors never cross
/// this boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Conflict,
    Stale,
    Fatal,
}

impl EngineError {
    pub fn outcome(&self) -> Outcome {
        match self {
            EngineError::Storage(StorageError::CrossSdMoveConflict { .. }) => Outcome::Conflict,
            EngineError::StaleSync { .. } => Outcome::Stale,
            EngineError::Storage(StorageError::Fs(FsError::IoFatal { .. })) => Outcome::Fatal,
            EngineError::SdUnhealthy(_) => Outcome::Fatal,
            _ => Outcome::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
