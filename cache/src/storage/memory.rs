//! In-memory [Storage](super::Storage) implementation.

use super::{validate_partition_name, Error};
use commonware_utils::hex;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

type Content = Arc<RwLock<Vec<u8>>>;
type Partition = BTreeMap<Vec<u8>, Content>;

/// In-memory storage.
///
/// Blobs share their content with every open handle, so a removed blob stays readable through
/// handles opened before the removal.
#[derive(Clone, Default)]
pub struct Storage {
    partitions: Arc<Mutex<BTreeMap<String, Partition>>>,
}

impl super::Storage for Storage {
    type Blob = Blob;

    fn open(&self, partition: &str, name: &[u8]) -> Result<(Self::Blob, u64), Error> {
        validate_partition_name(partition)?;

        let mut partitions = self.partitions.lock().unwrap();
        let content = partitions
            .entry(partition.into())
            .or_default()
            .entry(name.into())
            .or_default()
            .clone();
        let len = content.read().unwrap().len() as u64;
        Ok((Blob { content }, len))
    }

    fn remove(&self, partition: &str, name: Option<&[u8]>) -> Result<(), Error> {
        validate_partition_name(partition)?;

        let mut partitions = self.partitions.lock().unwrap();
        match name {
            Some(name) => {
                partitions
                    .get_mut(partition)
                    .ok_or(Error::PartitionMissing(partition.into()))?
                    .remove(name)
                    .ok_or(Error::BlobMissing(partition.into(), hex(name)))?;
            }
            None => {
                partitions
                    .remove(partition)
                    .ok_or(Error::PartitionMissing(partition.into()))?;
            }
        }
        Ok(())
    }

    fn scan(&self, partition: &str) -> Result<Vec<Vec<u8>>, Error> {
        validate_partition_name(partition)?;

        let partitions = self.partitions.lock().unwrap();
        let partition = partitions
            .get(partition)
            .ok_or(Error::PartitionMissing(partition.into()))?;
        Ok(partition.keys().cloned().collect())
    }
}

/// A blob held in process memory.
#[derive(Clone)]
pub struct Blob {
    content: Content,
}

impl super::Blob for Blob {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        let offset: usize = offset.try_into().map_err(|_| Error::OffsetOverflow)?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(Error::OffsetOverflow)?;
        let content = self.content.read().unwrap();
        if end > content.len() {
            return Err(Error::BlobInsufficientLength);
        }
        buf.copy_from_slice(&content[offset..end]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        let offset: usize = offset.try_into().map_err(|_| Error::OffsetOverflow)?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(Error::OffsetOverflow)?;
        let mut content = self.content.write().unwrap();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn resize(&self, len: u64) -> Result<(), Error> {
        let len: usize = len.try_into().map_err(|_| Error::OffsetOverflow)?;
        self.content.write().unwrap().resize(len, 0);
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::run_storage_tests;

    #[test]
    fn test_memory_storage() {
        run_storage_tests(Storage::default());
    }
}
