//! Snapshot file codec: full document state plus its vector clock, written
//! atomically and loaded in descending-quality order on cold start.

use crate::error::CodecError;
use crate::vector_clock::VectorClock;

pub const MAGIC: [u8; 4] = *b"CSNP";
pub const VERSION: u8 = 1;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub created_at: u64,
    pub total_changes: u64,
    pub vector_clock: VectorClock,
    pub document_state: Vec<u8>,
}

pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>, CodecError> {
    let vc_json = serde_json::to_vec(&snapshot.vector_clock)
        .map_err(|e| CodecError::Serialization(e.to_string()))?;

    let mut buf = Vec::new();
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&snapshot.created_at.to_le_bytes());
    buf.extend_from_slice(&snapshot.total_changes.to_le_bytes());
    buf.extend_from_slice(&(vc_json.len() as u32).to_le_bytes());
    buf.extend_from_slice(&vc_json);
    buf.extend_from_slice(&(snapshot.document_state.len() as u32).to_le_bytes());
    buf.extend_from_slice(&snapshot.document_state);
    Ok(buf)
}

pub fn decode(buf: &[u8]) -> Result<Snapshot, CodecError> {
    let mut offset = 0usize;
    if buf.len() < 4 || buf[0..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    offset += 4;

    if buf.len() < offset + 1 {
        return Err(CodecError::Truncated { expected: offset + 1, found: buf.len() });
    }
    let version = buf[offset];
    offset += 1;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    if buf.len() < offset + 16 {
        return Err(CodecError::Truncated { expected: offset + 16, found: buf.len() });
    }
    let created_at = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
    offset += 8;
    let total_changes = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
    offset += 8;

    if buf.len() < offset + 4 {
        return Err(CodecError::Truncated { expected: offset + 4, found: buf.len() });
    }
    let vc_len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
    offset += 4;
    if buf.len() < offset + vc_len {
        return Err(CodecError::Truncated { expected: offset + vc_len, found: buf.len() });
    }
    let vector_clock: VectorClock =
        serde_json::from_slice(&buf[offset..offset + vc_len]).map_err(|e| CodecError::Serialization(e.to_string()))?;
    offset += vc_len;

    if buf.len() < offset + 4 {
        return Err(CodecError::Truncated { expected: offset + 4, found: buf.len() });
    }
    let doc_len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
    offset += 4;
    if buf.len() < offset + doc_len {
        return Err(CodecError::Truncated { expected: offset + doc_len, found: buf.len() });
    }
    let document_state = buf[offset..offset + doc_len].to_vec();

    Ok(Snapshot { created_at, total_changes, vector_clock, document_state })
}

pub fn snapshot_filename(created_at: u64, total_changes: u64) -> String {
    format!("{created_at}-{total_changes}.snapshot")
}

/// Parse a snapshot filename into `(createdAt, totalChanges)` for quality
/// ordering without decoding the whole file.
pub fn parse_snapshot_filename(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".snapshot")?;
    let (created_at, total_changes) = stem.split_once('-')?;
    Some((created_at.parse().ok()?, total_changes.parse().ok()?))
}

/// Order candidate snapshot filenames newest-timestamp-first, then
/// highest-totalChanges-first, as the load algorithm requires.
pub fn rank_candidates(mut names: Vec<String>) -> Vec<String> {
    names.sort_by(|a, b| {
        let a = parse_snapshot_filename(a).unwrap_or((0, 0));
        let b = parse_snapshot_filename(b).unwrap_or((0, 0));
        b.cmp(&a)
    });
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::InstanceId;

    #[test]
    fn encode_decode_round_trips() {
        let mut vc = VectorClock::new();
        vc.advance(InstanceId::new(), 5, 0, "f");
        let snapshot = Snapshot {
            created_at: 1700000000,
            total_changes: 42,
            vector_clock: vc,
            document_state: vec![9, 8, 7],
        };
        let encoded = encode(&snapshot).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.created_at, snapshot.created_at);
        assert_eq!(decoded.total_changes, snapshot.total_changes);
        assert_eq!(decoded.document_state, snapshot.document_state);
        assert_eq!(decoded.vector_clock, snapshot.vector_clock);
    }

    #[test]
    fn decode_rejects_corrupt_header() {
        let garbage = vec![0u8; 10];
        assert!(decode(&garbage).is_err());
    }

    #[test]
    fn rank_prefers_newest_timestamp_then_highest_total_changes() {
        let names = vec![
            "1000-5.snapshot".to_string(),
            "2000-1.snapshot".to_string(),
            "2000-9.snapshot".to_string(),
        ];
        let ranked = rank_candidates(names);
        assert_eq!(ranked, vec!["2000-9.snapshot", "2000-1.snapshot", "1000-5.snapshot"]);
    }
}
