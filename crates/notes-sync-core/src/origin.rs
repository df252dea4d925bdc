//! Typed origin marker threaded through the apply pipeline.
//!
//! The document's own update listener must recognise `Origin::Ipc` and not
//! write it back to disk (the write already happened); other origins drive
//! different bookkeeping. A value-typed enum keeps this a static match
//! instead of a string compare scattered across call sites.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Applied because `applyUpdate` already wrote it to disk; the doc's
    /// update listener must not re-persist it.
    Ipc,
    /// Applied while reconciling with a peer's on-disk state (activity sync).
    Reload,
    /// Applied while cold-loading a document for the first time.
    Load,
}

impl Origin {
    /// Whether an update with this origin should be broadcast to the UI as
    /// a remote change (used by the Comment Observer).
    pub fn is_remote(self) -> bool {
        matches!(self, Origin::Reload | Origin::Load)
    }
}
