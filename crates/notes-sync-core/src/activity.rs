//! Activity log: an append-only per-instance index of `(noteId, sequence)`
//! notifications that lets peers discover new updates without re-scanning
//! every `.crdtlog` file.

use crate::fs::FileSystem;
use crate::ids::{InstanceId, NoteId};
use std::sync::Arc;

pub const ACTIVITY_DIR: &str = ".activity";

/// One parsed line from an activity log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    pub note_id: NoteId,
    pub instance_id: InstanceId,
    pub sequence: u64,
}

pub fn activity_log_path(sd_root: &str, instance: InstanceId) -> String {
    format!("{sd_root}/{ACTIVITY_DIR}/{instance}.log")
}

pub fn format_line(note_id: NoteId, instance_id: InstanceId, sequence: u64) -> String {
    format!("{note_id}|{instance_id}_{sequence}\n")
}

pub fn parse_line(line: &str) -> Option<ActivityEntry> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        return None;
    }
    let (note_id, rest) = line.split_once('|')?;
    let (instance_id, sequence) = rest.rsplit_once('_')?;
    Some(ActivityEntry {
        note_id: note_id.parse().ok()?,
        instance_id: instance_id.parse().ok()?,
        sequence: sequence.parse().ok()?,
    })
}

pub fn parse_all(content: &str) -> Vec<ActivityEntry> {
    content.lines().filter_map(parse_line).collect()
}

/// Owned by the SD Router, one per SD. Records *this instance's* edits;
/// peers are discovered by listing other `.log` files under `.activity/`.
pub struct ActivityLogger {
    fs: Arc<dyn FileSystem>,
    sd_root: String,
    instance_id: InstanceId,
}

impl ActivityLogger {
    pub fn new(fs: Arc<dyn FileSystem>, sd_root: impl Into<String>, instance_id: InstanceId) -> Self {
        Self { fs, sd_root: sd_root.into(), instance_id }
    }

    pub async fn record_note_activity(&self, note_id: NoteId, sequence: u64) -> crate::fs::Result<()> {
        let path = activity_log_path(&self.sd_root, self.instance_id);
        let line = format_line(note_id, self.instance_id, sequence);
        self.fs.append(&path, line.as_bytes()).await
    }

    /// List every peer's activity log filename (including our own), as
    /// `(instance_id, path)` pairs.
    pub async fn list_peer_logs(&self) -> crate::fs::Result<Vec<(InstanceId, String)>> {
        let dir = format!("{}/{ACTIVITY_DIR}", self.sd_root);
        let entries = match self.fs.list(&dir).await {
            Ok(entries) => entries,
            Err(crate::error::FsError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(entries
            .into_iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| {
                let stem = e.name.strip_suffix(".log")?;
                let instance: InstanceId = stem.parse().ok()?;
                Some((instance, format!("{dir}/{}", e.name)))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    #[test]
    fn line_round_trips() {
        let note_id = NoteId::new();
        let instance_id = InstanceId::new();
        let line = format_line(note_id, instance_id, 42);
        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.note_id, note_id);
        assert_eq!(parsed.instance_id, instance_id);
        assert_eq!(parsed.sequence, 42);
    }

    #[test]
    fn parse_all_skips_blank_lines() {
        let note_id = NoteId::new();
        let instance_id = InstanceId::new();
        let content = format!("\n{}\n\n", format_line(note_id, instance_id, 1).trim_end());
        assert_eq!(parse_all(&content).len(), 1);
    }

    #[tokio::test]
    async fn record_note_activity_appends_a_line() {
        let fs = Arc::new(InMemoryFs::new());
        let instance_id = InstanceId::new();
        let logger = ActivityLogger::new(fs.clone(), "sd", instance_id);
        let note_id = NoteId::new();

        logger.record_note_activity(note_id, 0).await.unwrap();
        logger.record_note_activity(note_id, 1).await.unwrap();

        let content = fs.read(&activity_log_path("sd", instance_id)).await.unwrap();
        let entries = parse_all(&String::from_utf8(content).unwrap());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 1);
    }

    #[tokio::test]
    async fn list_peer_logs_is_empty_before_the_directory_exists() {
        let fs = Arc::new(InMemoryFs::new());
        let logger = ActivityLogger::new(fs, "sd", InstanceId::new());
        assert!(logger.list_peer_logs().await.unwrap().is_empty());
    }
}
