//! Persisted per-key records (blob id and content length).
//!
//! # Format
//!
//! Records are serialized in either a "left" or "right" blob:
//!
//! ```text
//! +---------+---------+---------+---------+---------+---------+-----+---------+
//! | Version | Id (u32)| Known   | Length  | KeyLen  | Key     | ... | CRC32   |
//! | (u64)   |         | (u8)    | (u64)   | (u32)   | (bytes) |     | (u32)   |
//! +---------+---------+---------+---------+---------+---------+-----+---------+
//! ```
//!
//! Each sync writes the complete table to the blob holding the older version and only then
//! considers it current, so a torn write never destroys the last complete table. A blob whose
//! checksum does not match is ignored (and truncated).

use crate::storage::{Blob, Error, Storage};
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const BLOB_NAMES: [&[u8]; 2] = [b"left", b"right"];

const VERSION_SIZE: usize = 8;
const CHECKSUM_SIZE: usize = 4;
const RECORD_HEADER_SIZE: usize = 4 + 1 + 8 + 4;

/// What is persisted about a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Record {
    /// Identifier embedded in the names of the key's blobs.
    pub id: u32,
    /// Total length of the resource, if resolved.
    pub length: Option<u64>,
}

/// Two-blob store of [Record]s.
pub(crate) struct Metadata<S: Storage> {
    cursor: usize,
    version: u64,
    blobs: [S::Blob; 2],
}

impl<S: Storage> Metadata<S> {
    /// Open the blobs in `partition` and recover the latest complete table.
    pub fn init(
        storage: &S,
        partition: &str,
    ) -> Result<(Self, BTreeMap<String, Record>), Error> {
        let (left, left_len) = storage.open(partition, BLOB_NAMES[0])?;
        let (right, right_len) = storage.open(partition, BLOB_NAMES[1])?;
        let left_result = Self::load(&left, left_len)?;
        let right_result = Self::load(&right, right_len)?;

        // Choose the blob with the latest version
        let (cursor, version, records) = match (left_result, right_result) {
            (Some((lv, lr)), Some((rv, _))) if lv >= rv => (0, lv, lr),
            (_, Some((rv, rr))) => (1, rv, rr),
            (Some((lv, lr)), None) => (0, lv, lr),
            (None, None) => (1, 0, BTreeMap::new()),
        };
        debug!(partition, version, keys = records.len(), "loaded metadata");
        Ok((
            Self {
                cursor,
                version,
                blobs: [left, right],
            },
            records,
        ))
    }

    /// Read and verify a blob, truncating it if it is corrupt.
    fn load(
        blob: &S::Blob,
        len: u64,
    ) -> Result<Option<(u64, BTreeMap<String, Record>)>, Error> {
        if len == 0 {
            return Ok(None);
        }
        let len: usize = len.try_into().map_err(|_| Error::OffsetOverflow)?;
        let mut buf = vec![0u8; len];
        blob.read_at(&mut buf, 0)?;
        match decode(&buf) {
            Some(result) => Ok(Some(result)),
            None => {
                warn!(len, "metadata corrupt: truncating");
                blob.resize(0)?;
                blob.sync()?;
                Ok(None)
            }
        }
    }

    /// Durably replace the persisted table with `records`.
    pub fn sync(&mut self, records: &BTreeMap<String, Record>) -> Result<(), Error> {
        let version = self.version + 1;
        let buf = encode(version, records);
        let target = 1 - self.cursor;
        let blob = &self.blobs[target];
        blob.write_at(&buf, 0)?;
        blob.resize(buf.len() as u64)?;
        blob.sync()?;

        self.cursor = target;
        self.version = version;
        debug!(version, keys = records.len(), "synced metadata");
        Ok(())
    }
}

fn encode(version: u64, records: &BTreeMap<String, Record>) -> Vec<u8> {
    let size = VERSION_SIZE
        + records
            .keys()
            .map(|key| RECORD_HEADER_SIZE + key.len())
            .sum::<usize>()
        + CHECKSUM_SIZE;
    let mut buf = Vec::with_capacity(size);
    buf.put_u64(version);
    for (key, record) in records {
        buf.put_u32(record.id);
        buf.put_u8(record.length.is_some() as u8);
        buf.put_u64(record.length.unwrap_or_default());
        buf.put_u32(key.len() as u32);
        buf.put_slice(key.as_bytes());
    }
    let checksum = crc32fast::hash(&buf);
    buf.put_u32(checksum);
    buf
}

fn decode(data: &[u8]) -> Option<(u64, BTreeMap<String, Record>)> {
    if data.len() < VERSION_SIZE + CHECKSUM_SIZE {
        return None;
    }
    let (body, mut stored) = data.split_at(data.len() - CHECKSUM_SIZE);
    let stored = stored.get_u32();
    let computed = crc32fast::hash(body);
    if stored != computed {
        debug!(stored, computed, "checksum mismatch");
        return None;
    }

    let mut body = body;
    let version = body.get_u64();
    let mut records = BTreeMap::new();
    while body.has_remaining() {
        if body.remaining() < RECORD_HEADER_SIZE {
            return None;
        }
        let id = body.get_u32();
        let known = body.get_u8();
        let length = body.get_u64();
        let key_len = body.get_u32() as usize;
        if body.remaining() < key_len {
            return None;
        }
        let key = String::from_utf8(body[..key_len].to_vec()).ok()?;
        body.advance(key_len);
        let length = match known {
            0 => None,
            1 => Some(length),
            _ => return None,
        };
        records.insert(key, Record { id, length });
    }
    Some((version, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory;
    use commonware_macros::test_traced;

    fn records() -> BTreeMap<String, Record> {
        let mut records = BTreeMap::new();
        records.insert(
            "alpha".to_string(),
            Record {
                id: 0,
                length: Some(10),
            },
        );
        records.insert(
            "beta".to_string(),
            Record {
                id: 1,
                length: None,
            },
        );
        records
    }

    #[test_traced]
    fn test_metadata_empty() {
        let storage = memory::Storage::default();
        let (_, loaded) = Metadata::init(&storage, "meta").unwrap();
        assert!(loaded.is_empty());
    }

    #[test_traced]
    fn test_metadata_restart() {
        let storage = memory::Storage::default();
        let (mut metadata, _) = Metadata::init(&storage, "meta").unwrap();
        metadata.sync(&records()).unwrap();

        let (mut metadata, loaded) = Metadata::init(&storage, "meta").unwrap();
        assert_eq!(loaded, records());

        // A newer table wins over the older one
        let mut updated = records();
        updated.get_mut("beta").unwrap().length = Some(3);
        metadata.sync(&updated).unwrap();
        let (_, loaded) = Metadata::init(&storage, "meta").unwrap();
        assert_eq!(loaded, updated);
    }

    #[test_traced]
    fn test_metadata_corrupt_latest_falls_back() {
        let storage = memory::Storage::default();
        let (mut metadata, _) = Metadata::init(&storage, "meta").unwrap();
        metadata.sync(&records()).unwrap();
        let mut updated = records();
        updated.remove("alpha");
        metadata.sync(&updated).unwrap();

        // The second sync went to the other blob; flip a byte in it
        let name = BLOB_NAMES[metadata.cursor];
        let (blob, len) = storage.open("meta", name).unwrap();
        assert!(len > 0);
        let mut byte = [0u8; 1];
        blob.read_at(&mut byte, 9).unwrap();
        blob.write_at(&[byte[0] ^ 0xFF], 9).unwrap();

        let (_, loaded) = Metadata::init(&storage, "meta").unwrap();
        assert_eq!(loaded, records());

        // The corrupt blob was truncated
        let (_, len) = storage.open("meta", name).unwrap();
        assert_eq!(len, 0);
    }

    #[test]
    fn test_decode_rejects_truncated_record() {
        let mut buf = encode(1, &records());
        buf.truncate(buf.len() - 6);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32(checksum);
        assert!(decode(&buf).is_none());
    }
}
