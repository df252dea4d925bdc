//! `.crdtlog` record codec.
//!
//! Layout per record:
//! ```text
//! statusByte(1) | magic(4) | version(1) | timestamp(8 LE) | sequence(8 LE)
//!              | payloadLen(4 LE) | payload(payloadLen bytes)
//! ```
//!
//! Writing: append the record with `statusByte = 0x00`, fsync, then rewrite
//! just the status byte to `0x01` in place, fsync again. Readers scan
//! sequentially and stop at the first `0x00` - that byte and everything
//! after it is an in-progress write, invisible until finalized.

use crate::error::CodecError;

pub const MAGIC: [u8; 4] = *b"CLOG";
pub const VERSION: u8 = 1;

pub const STATUS_IN_PROGRESS: u8 = 0x00;
pub const STATUS_READY: u8 = 0x01;

const HEADER_LEN: usize = 1 + 4 + 1 + 8 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub timestamp: u64,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Encode a record with its status byte left at `0x00`. The caller appends
/// this, fsyncs, then uses [`finalize_offset`] to know where to flip the
/// status byte to `0x01` within the file it just appended to.
pub fn encode_record(record: &UpdateRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + record.payload.len());
    buf.push(STATUS_IN_PROGRESS);
    buf.extend_from_slice(&MAGIC);
    buf.push(VERSION);
    buf.extend_from_slice(&record.timestamp.to_le_bytes());
    buf.extend_from_slice(&record.sequence.to_le_bytes());
    buf.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&record.payload);
    buf
}

/// The status byte is always the first byte of the record; given the file
/// offset the record's first byte landed at, this is that same offset.
pub fn finalize_offset(record_start_offset: u64) -> u64 {
    record_start_offset
}

/// Decode every *ready* (`0x01`) record from a buffer, stopping at the first
/// `0x00` status byte or the first truncated/corrupt record. Returns the
/// decoded records plus the byte offset of the first unreadable byte (end of
/// visible tail), so callers can resume appending or re-scan from there.
pub fn decode_records(buf: &[u8]) -> (Vec<UpdateRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0usize;

    loop {
        match decode_one(&buf[offset..]) {
            Ok(Some((record, consumed))) => {
                records.push(record);
                offset += consumed;
            }
            Ok(None) | Err(_) => break,
        }
    }

    (records, offset)
}

/// Decode a single record at the start of `buf`. Returns `Ok(None)` for a
/// statusByte `0x00` (in-progress) or an empty buffer (clean end of file).
fn decode_one(buf: &[u8]) -> Result<Option<(UpdateRecord, usize)>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < HEADER_LEN {
        return Err(CodecError::Truncated { expected: HEADER_LEN, found: buf.len() });
    }

    let status = buf[0];
    if status == STATUS_IN_PROGRESS {
        return Ok(None);
    }
    if status != STATUS_READY {
        return Err(CodecError::BadMagic);
    }

    if &buf[1..5] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = buf[5];
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let timestamp = u64::from_le_bytes(buf[6..14].try_into().unwrap());
    let sequence = u64::from_le_bytes(buf[14..22].try_into().unwrap());
    let payload_len = u32::from_le_bytes(buf[22..26].try_into().unwrap()) as usize;

    let total = HEADER_LEN + payload_len;
    if buf.len() < total {
        return Err(CodecError::Truncated { expected: total, found: buf.len() });
    }

    let payload = buf[HEADER_LEN..total].to_vec();
    Ok(Some((UpdateRecord { timestamp, sequence, payload }, total)))
}

/// Filenames for the current format: `<instanceId>_<fileIndex>.crdtlog`.
pub fn crdtlog_filename(instance: &str, file_index: u32) -> String {
    format!("{instance}_{file_index}.crdtlog")
}

pub fn parse_crdtlog_filename(name: &str) -> Option<(String, u32)> {
    let stem = name.strip_suffix(".crdtlog")?;
    let (instance, index) = stem.rsplit_once('_')?;
    let index: u32 = index.parse().ok()?;
    Some((instance.to_string(), index))
}

/// Legacy per-file format: `<instanceId>_<sequence>-<random>.yjson`.
pub fn parse_legacy_yjson_filename(name: &str) -> Option<(String, u64)> {
    let stem = name.strip_suffix(".yjson")?;
    let (instance, rest) = stem.rsplit_once('_')?;
    let (sequence, _random) = rest.split_once('-')?;
    let sequence: u64 = sequence.parse().ok()?;
    Some((instance.to_string(), sequence))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalize(buf: &mut [u8], offset: usize) {
        buf[offset] = STATUS_READY;
    }

    #[test]
    fn round_trips_a_single_record() {
        let record = UpdateRecord { timestamp: 1000, sequence: 7, payload: vec![1, 2, 3, 4] };
        let mut buf = encode_record(&record);
        finalize(&mut buf, 0);

        let (decoded, offset) = decode_records(&buf);
        assert_eq!(decoded, vec![record]);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn in_progress_record_is_invisible() {
        let record = UpdateRecord { timestamp: 1000, sequence: 0, payload: vec![9] };
        let buf = encode_record(&record); // never finalized
        let (decoded, offset) = decode_records(&buf);
        assert!(decoded.is_empty());
        assert_eq!(offset, 0);
    }

    #[test]
    fn stops_at_first_in_progress_record_even_with_finalized_ones_before() {
        let r0 = UpdateRecord { timestamp: 1, sequence: 0, payload: vec![1] };
        let r1 = UpdateRecord { timestamp: 2, sequence: 1, payload: vec![2] };

        let mut buf = encode_record(&r0);
        finalize(&mut buf, 0);
        let second_start = buf.len();
        buf.extend(encode_record(&r1)); // left in-progress

        let (decoded, offset) = decode_records(&buf);
        assert_eq!(decoded, vec![r0]);
        assert_eq!(offset, second_start);
    }

    #[test]
    fn truncated_trailing_bytes_do_not_panic() {
        let record = UpdateRecord { timestamp: 1, sequence: 0, payload: vec![1, 2, 3] };
        let mut buf = encode_record(&record);
        finalize(&mut buf, 0);
        buf.truncate(buf.len() - 1);

        let (decoded, _offset) = decode_records(&buf);
        assert!(decoded.is_empty());
    }

    #[test]
    fn filenames_round_trip() {
        assert_eq!(parse_crdtlog_filename("abc123_4.crdtlog"), Some(("abc123".to_string(), 4)));
        assert_eq!(crdtlog_filename("abc123", 4), "abc123_4.crdtlog");
        assert_eq!(
            parse_legacy_yjson_filename("abc123_42-f00d.yjson"),
            Some(("abc123".to_string(), 42))
        );
    }
}
