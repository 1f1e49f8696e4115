//! Partitioned blob storage backing cached spans and metadata.
//!
//! A [Storage] addresses blobs by a `partition` and a binary `name`. Blobs are created on
//! [Storage::open], support positional reads and writes, and can be removed while other handles to
//! them remain open. Implementations are expected to keep removed blobs readable through handles
//! opened before the removal (as a POSIX `unlink` does), which is what allows spans to be evicted
//! while a reader is still streaming them.
//!
//! Two implementations are provided:
//! * [memory::Storage]: keeps blobs in process memory (useful for tests and small caches).
//! * [fs::Storage]: keeps blobs as files under a root directory.

use std::io::Error as IoError;
use thiserror::Error;

pub mod fs;
pub mod memory;

/// Errors that can occur when interacting with [Storage].
#[derive(Error, Debug)]
pub enum Error {
    #[error("partition name invalid, must only contain alphanumeric, dash ('-'), or underscore ('_') characters: {0}")]
    PartitionNameInvalid(String),
    #[error("partition creation failed: {0}")]
    PartitionCreationFailed(String),
    #[error("partition missing: {0}")]
    PartitionMissing(String),
    #[error("partition corrupt: {0}")]
    PartitionCorrupt(String),
    #[error("blob open failed: {0}/{1} error: {2}")]
    BlobOpenFailed(String, String, IoError),
    #[error("blob missing: {0}/{1}")]
    BlobMissing(String, String),
    #[error("blob resize failed: {0}/{1} error: {2}")]
    BlobResizeFailed(String, String, IoError),
    #[error("blob sync failed: {0}/{1} error: {2}")]
    BlobSyncFailed(String, String, IoError),
    #[error("blob insufficient length")]
    BlobInsufficientLength,
    #[error("read failed")]
    ReadFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("io error: {0}")]
    Io(#[from] IoError),
}

/// Interface to create, remove, and enumerate blobs.
///
/// Storage can be backed by a local filesystem, process memory, etc.
pub trait Storage: Clone + Send + Sync + 'static {
    /// The readable/writeable blob that can be opened by this [Storage].
    type Blob: Blob;

    /// Open an existing blob in a given partition or create a new one, returning
    /// the blob and its length.
    fn open(&self, partition: &str, name: &[u8]) -> Result<(Self::Blob, u64), Error>;

    /// Remove a blob from a given partition.
    ///
    /// If no `name` is provided, the entire partition is removed. Handles to the removed blob(s)
    /// that are already open stay readable.
    fn remove(&self, partition: &str, name: Option<&[u8]>) -> Result<(), Error>;

    /// Return all blobs in a given partition.
    fn scan(&self, partition: &str) -> Result<Vec<Vec<u8>>, Error>;
}

/// Interface to read and write to a blob.
///
/// Cloning a blob is similar to duplicating a file descriptor: all clones refer to the same
/// underlying data.
#[allow(clippy::len_without_is_empty)]
pub trait Blob: Clone + Send + Sync + 'static {
    /// Fill `buf` with the bytes starting at `offset`.
    ///
    /// Returns [Error::BlobInsufficientLength] if the blob ends before `buf` is filled.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error>;

    /// Write `buf` to the blob at the given offset, extending the blob if required.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error>;

    /// Resize the blob to the given length.
    ///
    /// If the length is greater than the current length, the blob is extended with zeros.
    fn resize(&self, len: u64) -> Result<(), Error>;

    /// Ensure all pending data is durably persisted.
    fn sync(&self) -> Result<(), Error>;
}

/// Validate that a partition name contains only allowed characters.
pub fn validate_partition_name(partition: &str) -> Result<(), Error> {
    if partition.is_empty()
        || partition
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || ['_', '-'].contains(&c)))
    {
        return Err(Error::PartitionNameInvalid(partition.into()));
    }
    Ok(())
}
