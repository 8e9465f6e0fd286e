//! Byte layout for log files, blocks, and items, per spec.md §6.
//!
//! A file begins with a header padded out to one sector. The remainder is a
//! sequence of blocks, each bracketed by a marker that must match the file's
//! marker; a block is valid only if both its leading and trailing markers
//! agree.

use byteorder::{ByteOrder, LittleEndian};
use rand::RngCore;

use crate::error::{CResult, Error};
use crate::model::LogGroupId;
use crate::store::object::CommitVersion;

pub const MARKER_LEN: usize = 16;
pub const HEADER_PAD: usize = 16 * 1024;
pub const FORMAT_VERSION: u64 = 1;

pub type Marker = [u8; MARKER_LEN];

pub fn random_marker() -> Marker {
    let mut marker = [0u8; MARKER_LEN];
    rand::thread_rng().fill_bytes(&mut marker);
    marker
}

/// The fixed log-file header, padded to `HEADER_PAD` bytes on disk so it
/// always occupies a whole sector regardless of the configured sector size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub format_version: u64,
    pub marker: Marker,
    pub sector_size: u32,
    pub timestamp: u32,
    pub has_snapshot: bool,
    pub packed_format: u8,
}

impl FileHeader {
    pub fn new(marker: Marker, sector_size: u32, timestamp: u32) -> Self {
        FileHeader {
            format_version: FORMAT_VERSION,
            marker,
            sector_size,
            timestamp,
            has_snapshot: false,
            packed_format: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_PAD];
        LittleEndian::write_u64(&mut out[0..8], self.format_version);
        out[8..24].copy_from_slice(&self.marker);
        LittleEndian::write_u32(&mut out[24..28], self.sector_size);
        LittleEndian::write_u32(&mut out[28..32], self.timestamp);
        out[32] = self.has_snapshot as u8;
        out[33] = self.packed_format;
        out
    }

    pub fn decode(buf: &[u8]) -> CResult<Self> {
        if buf.len() < 34 {
            return Err(Error::Corruption("log file header truncated".into()));
        }
        let format_version = LittleEndian::read_u64(&buf[0..8]);
        if format_version > FORMAT_VERSION {
            return Err(Error::UnsupportedFormat {
                found: format_version,
                max: FORMAT_VERSION,
            });
        }
        let mut marker = [0u8; MARKER_LEN];
        marker.copy_from_slice(&buf[8..24]);
        Ok(FileHeader {
            format_version,
            marker,
            sector_size: LittleEndian::read_u32(&buf[24..28]),
            timestamp: LittleEndian::read_u32(&buf[28..32]),
            has_snapshot: buf[32] != 0,
            packed_format: buf[33],
        })
    }
}

/// One transaction's durable record within a log group, per spec.md §6
/// "Log item fixed header".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogItem {
    pub commit_version: CommitVersion,
    pub local_term: u32,
    pub global_term: u128,
    pub affected_log_groups: u8,
    pub lsn: u64,
    pub changeset: Option<Vec<u8>>,
}

impl LogItem {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.commit_version.to_le_bytes());
        out.extend_from_slice(&self.local_term.to_le_bytes());
        out.extend_from_slice(&self.global_term.to_le_bytes());
        out.push(self.affected_log_groups);
        out.extend_from_slice(&self.lsn.to_le_bytes());
        match &self.changeset {
            None => out.extend_from_slice(&0u32.to_le_bytes()),
            Some(bytes) => {
                out.extend_from_slice(&1u32.to_le_bytes());
                out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                out.extend_from_slice(bytes);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> CResult<(Self, usize)> {
        let mut offset = 0usize;
        let need = |offset: usize, n: usize| -> CResult<()> {
            if offset + n > buf.len() {
                Err(Error::Corruption("log item truncated".into()))
            } else {
                Ok(())
            }
        };
        need(offset, 8)?;
        let commit_version = LittleEndian::read_u64(&buf[offset..offset + 8]);
        offset += 8;
        need(offset, 4)?;
        let local_term = LittleEndian::read_u32(&buf[offset..offset + 4]);
        offset += 4;
        need(offset, 16)?;
        let global_term = LittleEndian::read_u128(&buf[offset..offset + 16]);
        offset += 16;
        need(offset, 1)?;
        let affected_log_groups = buf[offset];
        offset += 1;
        need(offset, 8)?;
        let lsn = LittleEndian::read_u64(&buf[offset..offset + 8]);
        offset += 8;
        need(offset, 4)?;
        let changeset_count = LittleEndian::read_u32(&buf[offset..offset + 4]);
        offset += 4;
        let changeset = if changeset_count == 0 {
            None
        } else {
            need(offset, 8)?;
            let len = LittleEndian::read_u64(&buf[offset..offset + 8]) as usize;
            offset += 8;
            need(offset, len)?;
            let bytes = buf[offset..offset + len].to_vec();
            offset += len;
            Some(bytes)
        };
        Ok((
            LogItem {
                commit_version,
                local_term,
                global_term,
                affected_log_groups,
                lsn,
                changeset,
            },
            offset,
        ))
    }

    pub fn touches(&self, group: LogGroupId) -> bool {
        self.affected_log_groups & (1 << group) != 0
    }
}

/// Wraps a run of encoded `LogItem`s with the block header/trailer markers
/// described in spec.md §6 "Log block".
pub fn encode_block(marker: &Marker, items_payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 + MARKER_LEN + items_payload.len() + MARKER_LEN);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    let block_size = (8 + 8 + MARKER_LEN + items_payload.len() + MARKER_LEN) as u64;
    out.extend_from_slice(&block_size.to_le_bytes());
    out.extend_from_slice(marker);
    out.extend_from_slice(items_payload);
    out.extend_from_slice(marker);
    out
}

/// Parses one block, validating both markers match `expected_marker` and the
/// size header is internally consistent.
pub fn decode_block(buf: &[u8], expected_marker: &Marker) -> CResult<(Vec<u8>, usize)> {
    if buf.len() < 8 + 8 + MARKER_LEN * 2 {
        return Err(Error::Corruption("log block truncated".into()));
    }
    let _format_version = LittleEndian::read_u64(&buf[0..8]);
    let block_size = LittleEndian::read_u64(&buf[8..16]) as usize;
    if block_size > buf.len() || block_size < 8 + 8 + MARKER_LEN * 2 {
        return Err(Error::Corruption("log block size header inconsistent".into()));
    }
    let leading = &buf[16..16 + MARKER_LEN];
    if leading != expected_marker {
        return Err(Error::Corruption("log block leading marker mismatch".into()));
    }
    let payload_len = block_size - (8 + 8 + MARKER_LEN * 2);
    let payload_start = 16 + MARKER_LEN;
    let payload = &buf[payload_start..payload_start + payload_len];
    let trailer = &buf[payload_start + payload_len..payload_start + payload_len + MARKER_LEN];
    if trailer != expected_marker {
        return Err(Error::Corruption("log block trailing marker mismatch".into()));
    }
    Ok((payload.to_vec(), block_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = FileHeader::new(random_marker(), 4096, 7);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_PAD);
        let decoded = FileHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn log_item_round_trips_with_changeset() {
        let item = LogItem {
            commit_version: 42,
            local_term: 1,
            global_term: 99,
            affected_log_groups: 0b101,
            lsn: 7,
            changeset: Some(vec![1, 2, 3, 4]),
        };
        let encoded = item.encode();
        let (decoded, consumed) = LogItem::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, item);
        assert!(decoded.touches(0));
        assert!(decoded.touches(2));
        assert!(!decoded.touches(1));
    }

    #[test]
    fn block_round_trip_validates_markers() {
        let marker = random_marker();
        let payload = b"hello-items".to_vec();
        let block = encode_block(&marker, &payload);
        let (decoded_payload, consumed) = decode_block(&block, &marker).unwrap();
        assert_eq!(consumed, block.len());
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn block_rejects_wrong_marker() {
        let marker = random_marker();
        let other = random_marker();
        let block = encode_block(&marker, b"x");
        assert!(matches!(decode_block(&block, &other), Err(Error::Corruption(_))));
    }
}
