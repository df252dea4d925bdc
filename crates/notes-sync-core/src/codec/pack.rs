//! Pack file codec: compacts a contiguous sequence run for one instance into
//! a single file with an index, optionally zstd-framed.

use crate::error::CodecError;

pub const MAGIC: [u8; 4] = *b"CPCK";
pub const VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub sequence: u64,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pack {
    pub instance: String,
    pub start_seq: u64,
    pub end_seq: u64,
    pub entries: Vec<PackEntry>,
}

impl Pack {
    pub fn from_entries(instance: String, entries: Vec<PackEntry>) -> Self {
        let start_seq = entries.first().map(|e| e.sequence).unwrap_or(0);
        let end_seq = entries.last().map(|e| e.sequence).unwrap_or(0);
        Self { instance, start_seq, end_seq, entries }
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(buf: &[u8], offset: &mut usize) -> Result<String, CodecError> {
    if buf.len() < *offset + 4 {
        return Err(CodecError::Truncated { expected: *offset + 4, found: buf.len() });
    }
    let len = u32::from_le_bytes(buf[*offset..*offset + 4].try_into().unwrap()) as usize;
    *offset += 4;
    if buf.len() < *offset + len {
        return Err(CodecError::Truncated { expected: *offset + len, found: buf.len() });
    }
    let s = String::from_utf8_lossy(&buf[*offset..*offset + len]).into_owned();
    *offset += len;
    Ok(s)
}

/// Encode the pack's uncompressed bytes (header + index + payloads). Callers
/// that want the `.yjson.zst` variant pass this through `zstd::encode_all`.
pub fn encode(pack: &Pack) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    write_string(&mut buf, &pack.instance);
    buf.extend_from_slice(&pack.start_seq.to_le_bytes());
    buf.extend_from_slice(&pack.end_seq.to_le_bytes());
    buf.extend_from_slice(&(pack.entries.len() as u32).to_le_bytes());

    // index
    let mut running_offset = 0u64;
    let mut offsets = Vec::with_capacity(pack.entries.len());
    for entry in &pack.entries {
        offsets.push(running_offset);
        running_offset += entry.payload.len() as u64;
    }
    for (entry, offset) in pack.entries.iter().zip(&offsets) {
        buf.extend_from_slice(&entry.sequence.to_le_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&(entry.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&entry.timestamp.to_le_bytes());
    }

    // payloads, contiguous in index order
    for entry in &pack.entries {
        buf.extend_from_slice(&entry.payload);
    }

    buf
}

pub fn decode(buf: &[u8]) -> Result<Pack, CodecError> {
    let mut offset = 0usize;
    if buf.len() < 4 || buf[0..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    offset += 4;
    let version = buf[offset];
    offset += 1;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let instance = read_string(buf, &mut offset)?;

    if buf.len() < offset + 8 + 8 + 4 {
        return Err(CodecError::Truncated { expected: offset + 20, found: buf.len() });
    }
    let start_seq = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
    offset += 8;
    let end_seq = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
    offset += 8;
    let count = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
    offset += 4;

    struct IndexRow {
        sequence: u64,
        payload_offset: u64,
        payload_len: u32,
        timestamp: u64,
    }

    let mut rows = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.len() < offset + 28 {
            return Err(CodecError::Truncated { expected: offset + 28, found: buf.len() });
        }
        let sequence = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
        offset += 8;
        let payload_offset = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
        offset += 8;
        let payload_len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;
        let timestamp = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
        offset += 8;
        rows.push(IndexRow { sequence, payload_offset, payload_len, timestamp });
    }

    let payloads_start = offset;
    let mut entries = Vec::with_capacity(count);
    for row in rows {
        let start = payloads_start + row.payload_offset as usize;
        let end = start + row.payload_len as usize;
        if buf.len() < end {
            return Err(CodecError::Truncated { expected: end, found: buf.len() });
        }
        entries.push(PackEntry {
            sequence: row.sequence,
            timestamp: row.timestamp,
            payload: buf[start..end].to_vec(),
        });
    }

    Ok(Pack { instance, start_seq, end_seq, entries })
}

/// zstd-frame a pack's encoded bytes.
pub fn compress(encoded: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::encode_all(encoded, 0).map_err(|e| CodecError::Compression(e.to_string()))
}

pub fn decompress(framed: &[u8]) -> Result<Vec<u8>, CodecError> {
    zstd::decode_all(framed).map_err(|e| CodecError::Compression(e.to_string()))
}

pub fn pack_filename(instance: &str, start_seq: u64, end_seq: u64, compressed: bool) -> String {
    if compressed {
        format!("{instance}_{start_seq}-{end_seq}.yjson.zst")
    } else {
        format!("{instance}_{start_seq}-{end_seq}.yjson")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pack() -> Pack {
        Pack::from_entries(
            "instance-a".to_string(),
            vec![
                PackEntry { sequence: 10, timestamp: 111, payload: vec![1, 2, 3] },
                PackEntry { sequence: 11, timestamp: 222, payload: vec![4, 5] },
                PackEntry { sequence: 12, timestamp: 333, payload: vec![] },
            ],
        )
    }

    #[test]
    fn encode_decode_round_trips() {
        let pack = sample_pack();
        let encoded = encode(&pack);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, pack);
    }

    #[test]
    fn compressed_round_trips_too() {
        let pack = sample_pack();
        let encoded = encode(&pack);
        let framed = compress(&encoded).unwrap();
        let unframed = decompress(&framed).unwrap();
        assert_eq!(decode(&unframed).unwrap(), pack);
    }

    #[test]
    fn start_end_seq_derived_from_entries() {
        let pack = sample_pack();
        assert_eq!(pack.start_seq, 10);
        assert_eq!(pack.end_seq, 12);
    }

    #[test]
    fn filename_reflects_compression() {
        assert_eq!(pack_filename("i", 1, 2, false), "i_1-2.yjson");
        assert_eq!(pack_filename("i", 1, 2, true), "i_1-2.yjson.zst");
    }
}
