use bytes::{Buf, BufMut, BytesMut};

use crate::errors::{Errors, Result};

/// Longest key the record header can describe.
pub const MAX_KEY_SIZE: usize = 128;

/// crc(4) + flags(1) + key size(1) + value size(4) + sequence number(8)
pub const HEADER_SIZE: usize = 18;

const TOMBSTONE_FLAG: u8 = 0b0000_0001;
const KNOWN_FLAGS: u8 = TOMBSTONE_FLAG;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordType {
  Normal,

  Deleted,
}

/// A single key/value or tombstone record as laid out in a data file:
///
/// ```text
/// | crc u32 | flags u8 | key size u8 | value size u32 | seq u64 | key | value |
/// ```
///
/// The crc covers every byte after itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
  pub key: Vec<u8>,
  pub value: Vec<u8>,
  pub rec_type: LogRecordType,
  pub seq: u64,
}

impl LogRecord {
  pub fn normal(key: Vec<u8>, value: Vec<u8>, seq: u64) -> Self {
    Self {
      key,
      value,
      rec_type: LogRecordType::Normal,
      seq,
    }
  }

  pub fn tombstone(key: Vec<u8>, seq: u64) -> Self {
    Self {
      key,
      value: Vec::new(),
      rec_type: LogRecordType::Deleted,
      seq,
    }
  }

  pub fn is_tombstone(&self) -> bool {
    self.rec_type == LogRecordType::Deleted
  }

  pub fn encoded_size(&self) -> u64 {
    encoded_len(self.key.len(), self.value.len())
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(self.encoded_size() as usize);
    buf.put_u32(0);
    buf.put_u8(match self.rec_type {
      LogRecordType::Normal => 0,
      LogRecordType::Deleted => TOMBSTONE_FLAG,
    });
    buf.put_u8(self.key.len() as u8);
    buf.put_u32(self.value.len() as u32);
    buf.put_u64(self.seq);
    buf.extend_from_slice(&self.key);
    buf.extend_from_slice(&self.value);

    let crc = crc32fast::hash(&buf[4..]);
    buf[..4].copy_from_slice(&crc.to_be_bytes());
    buf.to_vec()
  }
}

/// On-disk size of a record about to be written. Computed from the full
/// lengths, so oversized values are caught before the header narrows them.
pub fn encoded_len(key_len: usize, value_len: usize) -> u64 {
  (HEADER_SIZE as u64)
    .saturating_add(key_len as u64)
    .saturating_add(value_len as u64)
}

/// Total on-disk size of a record with the given key and value sizes.
pub fn record_size(key_size: usize, value_size: u32) -> u64 {
  (HEADER_SIZE + key_size) as u64 + value_size as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
  pub crc: u32,
  pub flags: u8,
  pub key_size: u8,
  pub value_size: u32,
  pub seq: u64,
}

impl RecordHeader {
  pub fn decode(mut buf: &[u8]) -> Result<Self> {
    if buf.len() < HEADER_SIZE {
      return Err(Errors::IncompleteRecord);
    }
    let header = RecordHeader {
      crc: buf.get_u32(),
      flags: buf.get_u8(),
      key_size: buf.get_u8(),
      value_size: buf.get_u32(),
      seq: buf.get_u64(),
    };
    if header.key_size == 0
      || header.key_size as usize > MAX_KEY_SIZE
      || header.flags & !KNOWN_FLAGS != 0
    {
      return Err(Errors::CorruptedRecord);
    }
    if header.is_tombstone() && header.value_size != 0 {
      return Err(Errors::CorruptedRecord);
    }
    Ok(header)
  }

  pub fn is_tombstone(&self) -> bool {
    self.flags & TOMBSTONE_FLAG != 0
  }

  pub fn record_size(&self) -> u64 {
    record_size(self.key_size as usize, self.value_size)
  }

  /// Checks the crc against the raw header and body bytes and splits the body.
  pub fn into_record(self, header_buf: &[u8], body: &[u8]) -> Result<LogRecord> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header_buf[4..HEADER_SIZE]);
    hasher.update(body);
    if hasher.finalize() != self.crc {
      return Err(Errors::InvalidLogRecordCrc);
    }

    let key_size = self.key_size as usize;
    Ok(LogRecord {
      key: body[..key_size].to_vec(),
      value: body[key_size..].to_vec(),
      rec_type: if self.is_tombstone() {
        LogRecordType::Deleted
      } else {
        LogRecordType::Normal
      },
      seq: self.seq,
    })
  }
}

/// Where the most recent copy of a key lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecordPos {
  pub file_id: u32,
  pub offset: u64,
  pub value_size: u32,
  pub seq: u64,
}

impl LogRecordPos {
  pub fn record_size(&self, key_size: usize) -> u64 {
    record_size(key_size, self.value_size)
  }

  /// Same physical record, ignoring the sequence number.
  pub fn same_location(&self, other: &LogRecordPos) -> bool {
    self.file_id == other.file_id && self.offset == other.offset
  }
}

pub struct ReadLogRecord {
  pub record: LogRecord,
  pub size: u64,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn decode(buf: &[u8]) -> Result<LogRecord> {
    let header = RecordHeader::decode(buf)?;
    header.into_record(&buf[..HEADER_SIZE], &buf[HEADER_SIZE..])
  }

  #[test]
  fn test_log_record_encode_and_decode() {
    let rec = LogRecord::normal(b"name".to_vec(), b"bitcask-rs".to_vec(), 7);
    let enc = rec.encode();
    assert_eq!(enc.len() as u64, rec.encoded_size());
    assert_eq!(enc.len(), HEADER_SIZE + 4 + 10);
    assert_eq!(decode(&enc).unwrap(), rec);

    let header = RecordHeader::decode(&enc).unwrap();
    assert_eq!(header.seq, 7);
    assert_eq!(header.key_size, 4);
    assert_eq!(header.value_size, 10);
    assert!(!header.is_tombstone());
  }

  #[test]
  fn test_tombstone_record() {
    let rec = LogRecord::tombstone(b"gone".to_vec(), 11);
    let enc = rec.encode();
    assert_eq!(enc.len(), HEADER_SIZE + 4);
    let decoded = decode(&enc).unwrap();
    assert!(decoded.is_tombstone());
    assert!(decoded.value.is_empty());
  }

  #[test]
  fn test_crc_mismatch_is_detected() {
    let mut enc = LogRecord::normal(b"key".to_vec(), b"value".to_vec(), 1).encode();
    let last = enc.len() - 1;
    enc[last] ^= 0xff;
    assert_eq!(decode(&enc).err(), Some(Errors::InvalidLogRecordCrc));
  }

  #[test]
  fn test_corrupted_header() {
    let mut enc = LogRecord::normal(b"key".to_vec(), b"value".to_vec(), 1).encode();
    enc[5] = 0;
    assert_eq!(RecordHeader::decode(&enc).err(), Some(Errors::CorruptedRecord));

    let mut enc = LogRecord::normal(b"key".to_vec(), b"value".to_vec(), 1).encode();
    enc[4] = 0b1000_0000;
    assert_eq!(RecordHeader::decode(&enc).err(), Some(Errors::CorruptedRecord));

    assert_eq!(
      RecordHeader::decode(&[0u8; 5]).err(),
      Some(Errors::IncompleteRecord)
    );
  }

  #[test]
  fn test_encoded_len_keeps_full_value_length() {
    let four_gib = 1usize << 32;
    assert_eq!(encoded_len(3, four_gib), (HEADER_SIZE + 3) as u64 + (1u64 << 32));
    assert!(encoded_len(3, four_gib) > u32::MAX as u64);
    assert_eq!(encoded_len(0, usize::MAX), u64::MAX);
    assert_eq!(encoded_len(4, 10), (HEADER_SIZE + 14) as u64);
  }

  #[test]
  fn test_log_record_pos() {
    let pos = LogRecordPos {
      file_id: 3,
      offset: 100,
      value_size: 10,
      seq: 9,
    };
    assert_eq!(pos.record_size(5), (HEADER_SIZE + 15) as u64);
    let moved = LogRecordPos { seq: 10, ..pos };
    assert!(pos.same_location(&moved));
    assert!(!pos.same_location(&LogRecordPos { offset: 0, ..pos }));
  }
}
