//! Vector clocks: the highest sequence this instance has absorbed per peer
//! instance, plus enough location hints for GC to know what it can reclaim.

use crate::ids::InstanceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a given (instance, sequence) boundary lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEntry {
    pub sequence: u64,
    pub offset: u64,
    pub file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<InstanceId, ClockEntry>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence_for(&self, instance: InstanceId) -> Option<u64> {
        self.entries.get(&instance).map(|e| e.sequence)
    }

    pub fn entry_for(&self, instance: InstanceId) -> Option<&ClockEntry> {
        self.entries.get(&instance)
    }

    /// Record that `instance`'s update at `sequence` is now absorbed, living
    /// at `offset` in `file`. Monotonic: a lower sequence never overwrites a
    /// higher one already recorded.
    pub fn advance(&mut self, instance: InstanceId, sequence: u64, offset: u64, file: impl Into<String>) {
        let file = file.into();
        match self.entries.get_mut(&instance) {
            Some(existing) if existing.sequence >= sequence => {}
            Some(existing) => {
                existing.sequence = sequence;
                existing.offset = offset;
                existing.file = file;
            }
            None => {
                self.entries.insert(instance, ClockEntry { sequence, offset, file });
            }
        }
    }

    /// Whether `(instance, sequence)` has already been absorbed.
    pub fn has_absorbed(&self, instance: InstanceId, sequence: u64) -> bool {
        self.sequence_for(instance).is_some_and(|max| sequence <= max)
    }

    /// Whether `self` dominates `other`: every entry in `other` is absorbed
    /// by `self`. Used by GC to confirm a snapshot supersedes an update file.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .entries
            .iter()
            .all(|(instance, entry)| self.has_absorbed(*instance, entry.sequence))
    }

    pub fn merge_from(&mut self, other: &VectorClock) {
        for (instance, entry) in &other.entries {
            self.advance(*instance, entry.sequence, entry.offset, entry.file.clone());
        }
    }

    pub fn instances(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.entries.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_ignores_lower_sequence() {
        let mut vc = VectorClock::new();
        let a = InstanceId::new();
        vc.advance(a, 10, 0, "f");
        vc.advance(a, 5, 0, "f");
        assert_eq!(vc.sequence_for(a), Some(10));
    }

    #[test]
    fn dominates_checks_every_entry() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        let mut lhs = VectorClock::new();
        lhs.advance(a, 10, 0, "f");
        lhs.advance(b, 5, 0, "f");

        let mut rhs = VectorClock::new();
        rhs.advance(a, 9, 0, "f");
        assert!(lhs.dominates(&rhs));

        rhs.advance(b, 6, 0, "f");
        assert!(!lhs.dominates(&rhs));
    }

    #[test]
    fn merge_from_takes_the_max_per_instance() {
        let a = InstanceId::new();
        let mut lhs = VectorClock::new();
        lhs.advance(a, 3, 0, "f");
        let mut rhs = VectorClock::new();
        rhs.advance(a, 7, 1, "g");
        lhs.merge_from(&rhs);
        assert_eq!(lhs.sequence_for(a), Some(7));
    }
}
