//! On-disk record codecs: individual updates, compacted packs, and full
//! document snapshots.

pub mod pack;
pub mod snapshot;
pub mod update_log;
