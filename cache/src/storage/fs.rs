//! Local filesystem [Storage](super::Storage) implementation.
//!
//! Each partition is a directory under [Config::storage_directory] and each blob a file named by
//! the hex encoding of its name.

use super::{validate_partition_name, Error};
use commonware_utils::{from_hex, hex};
use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Configuration for [Storage].
#[derive(Clone)]
pub struct Config {
    /// Directory holding one subdirectory per partition.
    pub storage_directory: PathBuf,
}

impl Config {
    pub fn new(storage_directory: PathBuf) -> Self {
        Self { storage_directory }
    }
}

/// Storage backed by files on the local filesystem.
#[derive(Clone)]
pub struct Storage {
    lock: Arc<Mutex<()>>,
    cfg: Config,
}

impl Storage {
    pub fn new(cfg: Config) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            cfg,
        }
    }
}

/// Syncs a directory to ensure directory entry changes are durable.
#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<(), Error> {
    let dir = File::open(path).map_err(|e| {
        Error::BlobOpenFailed(path.to_string_lossy().to_string(), "directory".into(), e)
    })?;
    dir.sync_all().map_err(|e| {
        Error::BlobSyncFailed(path.to_string_lossy().to_string(), "directory".into(), e)
    })
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<(), Error> {
    Ok(())
}

impl super::Storage for Storage {
    type Blob = Blob;

    fn open(&self, partition: &str, name: &[u8]) -> Result<(Self::Blob, u64), Error> {
        validate_partition_name(partition)?;
        let _guard = self.lock.lock().unwrap();

        // Create the partition directory, if it does not exist
        let dir = self.cfg.storage_directory.join(partition);
        let existed = dir.exists();
        fs::create_dir_all(&dir).map_err(|_| Error::PartitionCreationFailed(partition.into()))?;
        if !existed {
            sync_dir(&self.cfg.storage_directory)?;
        }

        // Open the file, creating it if it doesn't exist
        let path = dir.join(hex(name));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::BlobOpenFailed(partition.into(), hex(name), e))?;
        let len = file.metadata().map_err(|_| Error::ReadFailed)?.len();

        // Make the directory entry of a new file durable
        if len == 0 {
            file.sync_all()
                .map_err(|e| Error::BlobSyncFailed(partition.into(), hex(name), e))?;
            sync_dir(&dir)?;
        }

        Ok((Blob::new(partition.into(), name, file), len))
    }

    fn remove(&self, partition: &str, name: Option<&[u8]>) -> Result<(), Error> {
        validate_partition_name(partition)?;
        let _guard = self.lock.lock().unwrap();

        let path = self.cfg.storage_directory.join(partition);
        match name {
            Some(name) => {
                fs::remove_file(path.join(hex(name)))
                    .map_err(|_| Error::BlobMissing(partition.into(), hex(name)))?;
                sync_dir(&path)?;
            }
            None => {
                fs::remove_dir_all(&path)
                    .map_err(|_| Error::PartitionMissing(partition.into()))?;
                sync_dir(&self.cfg.storage_directory)?;
            }
        }
        Ok(())
    }

    fn scan(&self, partition: &str) -> Result<Vec<Vec<u8>>, Error> {
        validate_partition_name(partition)?;
        let _guard = self.lock.lock().unwrap();

        let path = self.cfg.storage_directory.join(partition);
        let entries =
            fs::read_dir(&path).map_err(|_| Error::PartitionMissing(partition.into()))?;
        let mut blobs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|_| Error::ReadFailed)?;
            let file_type = entry.file_type().map_err(|_| Error::ReadFailed)?;
            if !file_type.is_file() {
                return Err(Error::PartitionCorrupt(partition.into()));
            }
            if let Some(name) = entry.file_name().to_str() {
                let name = from_hex(name).ok_or(Error::PartitionCorrupt(partition.into()))?;
                blobs.push(name);
            }
        }
        Ok(blobs)
    }
}

/// A blob stored as a single file.
#[derive(Clone)]
pub struct Blob {
    partition: String,
    name: Vec<u8>,
    #[cfg(unix)]
    file: Arc<File>,
    // Files must be seeked prior to any read or write operation on platforms without positional
    // I/O and are thus not safe to concurrently interact with.
    #[cfg(not(unix))]
    file: Arc<Mutex<File>>,
}

impl Blob {
    fn new(partition: String, name: &[u8], file: File) -> Self {
        Self {
            partition,
            name: name.into(),
            #[cfg(unix)]
            file: Arc::new(file),
            #[cfg(not(unix))]
            file: Arc::new(Mutex::new(file)),
        }
    }
}

#[cfg(unix)]
impl super::Blob for Blob {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        use std::os::unix::fs::FileExt;

        self.file.read_exact_at(buf, offset).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::BlobInsufficientLength,
            _ => Error::ReadFailed,
        })
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        use std::os::unix::fs::FileExt;

        self.file
            .write_all_at(buf, offset)
            .map_err(|_| Error::WriteFailed)
    }

    fn resize(&self, len: u64) -> Result<(), Error> {
        self.file
            .set_len(len)
            .map_err(|e| Error::BlobResizeFailed(self.partition.clone(), hex(&self.name), e))
    }

    fn sync(&self) -> Result<(), Error> {
        self.file
            .sync_all()
            .map_err(|e| Error::BlobSyncFailed(self.partition.clone(), hex(&self.name), e))
    }
}

#[cfg(not(unix))]
impl super::Blob for Blob {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), Error> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| Error::ReadFailed)?;
        file.read_exact(buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::BlobInsufficientLength,
            _ => Error::ReadFailed,
        })
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        use std::io::{Seek, SeekFrom, Write};

        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(|_| Error::WriteFailed)?;
        file.write_all(buf).map_err(|_| Error::WriteFailed)
    }

    fn resize(&self, len: u64) -> Result<(), Error> {
        let file = self.file.lock().unwrap();
        file.set_len(len)
            .map_err(|e| Error::BlobResizeFailed(self.partition.clone(), hex(&self.name), e))
    }

    fn sync(&self) -> Result<(), Error> {
        let file = self.file.lock().unwrap();
        file.sync_all()
            .map_err(|e| Error::BlobSyncFailed(self.partition.clone(), hex(&self.name), e))
    }
}
