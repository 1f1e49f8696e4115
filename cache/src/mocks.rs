//! Test doubles for an [Upstream] and a [Storage].

use crate::{
    source::Request,
    storage::{Blob as BlobTrait, Error as StorageError, Storage as StorageTrait},
    upstream::{Error, Upstream},
};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

/// A resource served by [FakeUpstream].
#[derive(Clone, Debug)]
pub struct Resource {
    data: Arc<[u8]>,
    unknown_length: bool,
    fail_from: Option<u64>,
}

impl Resource {
    /// Serve `data`, reporting its length on open.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into().into(),
            unknown_length: false,
            fail_from: None,
        }
    }

    /// Do not report the length of unbounded requests.
    pub fn with_unknown_length(mut self) -> Self {
        self.unknown_length = true;
        self
    }

    /// Fail any read that would return a byte at or past `offset`.
    pub fn with_failure_from(mut self, offset: u64) -> Self {
        self.fail_from = Some(offset);
        self
    }

    /// Fail every read.
    pub fn failing(self) -> Self {
        self.with_failure_from(0)
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// An opened request.
struct Open {
    resource: Resource,
    position: u64,
    end: u64,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<String, Resource>,
    default: Option<Resource>,

    opened: Vec<Request>,
}

/// An [Upstream] serving resources from memory.
///
/// Clones share the same resources and request log, so a test can keep a handle to inspect the
/// requests made by a [crate::source::CachedSource] that owns another clone. Each clone has its
/// own open request.
#[derive(Default)]
pub struct FakeUpstream {
    inner: Arc<Mutex<Inner>>,
    current: Option<Open>,
}

impl Clone for FakeUpstream {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            current: None,
        }
    }
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `data` for `key`.
    pub fn with_resource(self, key: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.with(key, Resource::new(data))
    }

    /// Serve `resource` for `key`.
    pub fn with(self, key: impl Into<String>, resource: Resource) -> Self {
        self.inner
            .lock()
            .unwrap()
            .resources
            .insert(key.into(), resource);
        self
    }

    /// Serve `resource` for any key without a resource of its own.
    pub fn with_default(self, resource: Resource) -> Self {
        self.inner.lock().unwrap().default = Some(resource);
        self
    }

    /// Returns all requests opened so far.
    pub fn opened(&self) -> Vec<Request> {
        self.inner.lock().unwrap().opened.clone()
    }

    /// Returns and clears all requests opened so far.
    pub fn take_opened(&self) -> Vec<Request> {
        std::mem::take(&mut self.inner.lock().unwrap().opened)
    }
}

impl Upstream for FakeUpstream {
    fn open(&mut self, request: &Request) -> Result<Option<u64>, Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.opened.push(request.clone());
        let resource = inner
            .resources
            .get(&request.key)
            .or(inner.default.as_ref())
            .cloned()
            .ok_or_else(|| Error::Other(format!("unknown resource: {}", request.key)))?;
        if request.start >= resource.len() {
            return Err(Error::RangeNotSatisfiable);
        }
        let available = resource.len() - request.start;
        let (end, resolved) = match request.length {
            Some(length) => {
                let length = length.min(available);
                (request.start + length, Some(length))
            }
            None if resource.unknown_length => (resource.len(), None),
            None => (resource.len(), Some(available)),
        };
        drop(inner);
        self.current = Some(Open {
            resource,
            position: request.start,
            end,
        });
        Ok(resolved)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| Error::Other("not open".into()))?;
        let n = (open.end - open.position).min(buf.len() as u64);
        if n == 0 {
            return Ok(0);
        }
        if let Some(fail_from) = open.resource.fail_from {
            if open.position + n > fail_from {
                return Err(Error::Other(format!(
                    "read of {n} bytes at {} failed",
                    open.position
                )));
            }
        }
        let start = open.position as usize;
        buf[..n as usize].copy_from_slice(&open.resource.data[start..start + n as usize]);
        open.position += n;
        Ok(n as usize)
    }

    fn close(&mut self) {
        self.current = None;
    }
}

#[derive(Default)]
struct Faults {
    writes: HashSet<String>,
    opens: HashSet<String>,
}

/// A [StorageTrait] wrapper that fails operations on selected partitions on demand.
///
/// Faults apply to every clone and to blobs opened before they were injected.
#[derive(Clone)]
pub struct FailingStorage<S: StorageTrait> {
    inner: S,
    faults: Arc<Mutex<Faults>>,
}

impl<S: StorageTrait> FailingStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Arc::default(),
        }
    }

    /// Fail writes, resizes, and syncs of blobs in `partition`.
    pub fn fail_writes(&self, partition: &str) {
        self.faults.lock().unwrap().writes.insert(partition.into());
    }

    /// Fail opening blobs in `partition`.
    pub fn fail_opens(&self, partition: &str) {
        self.faults.lock().unwrap().opens.insert(partition.into());
    }

    /// Remove all injected faults.
    pub fn heal(&self) {
        let mut faults = self.faults.lock().unwrap();
        faults.writes.clear();
        faults.opens.clear();
    }
}

impl<S: StorageTrait> StorageTrait for FailingStorage<S> {
    type Blob = FailingBlob<S::Blob>;

    fn open(&self, partition: &str, name: &[u8]) -> Result<(Self::Blob, u64), StorageError> {
        if self.faults.lock().unwrap().opens.contains(partition) {
            return Err(StorageError::ReadFailed);
        }
        let (inner, len) = self.inner.open(partition, name)?;
        let blob = FailingBlob {
            inner,
            partition: partition.into(),
            faults: self.faults.clone(),
        };
        Ok((blob, len))
    }

    fn remove(&self, partition: &str, name: Option<&[u8]>) -> Result<(), StorageError> {
        self.inner.remove(partition, name)
    }

    fn scan(&self, partition: &str) -> Result<Vec<Vec<u8>>, StorageError> {
        self.inner.scan(partition)
    }
}

/// A blob of [FailingStorage].
#[derive(Clone)]
pub struct FailingBlob<B: BlobTrait> {
    inner: B,
    partition: String,
    faults: Arc<Mutex<Faults>>,
}

impl<B: BlobTrait> FailingBlob<B> {
    fn check_write(&self) -> Result<(), StorageError> {
        if self.faults.lock().unwrap().writes.contains(&self.partition) {
            return Err(StorageError::WriteFailed);
        }
        Ok(())
    }
}

impl<B: BlobTrait> BlobTrait for FailingBlob<B> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), StorageError> {
        self.inner.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.write_at(buf, offset)
    }

    fn resize(&self, len: u64) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.resize(len)
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory;

    #[test]
    fn test_fake_upstream_bounds() {
        let mut upstream = FakeUpstream::new().with_resource("key", b"0123456789".to_vec());
        assert_eq!(
            upstream.open(&Request::new("key", 8, Some(5))).unwrap(),
            Some(2)
        );
        let mut buf = [0; 8];
        assert_eq!(upstream.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(upstream.read(&mut buf).unwrap(), 0);

        assert!(matches!(
            upstream.open(&Request::new("key", 10, None)),
            Err(Error::RangeNotSatisfiable)
        ));
        assert!(matches!(
            upstream.open(&Request::new("missing", 0, None)),
            Err(Error::Other(_))
        ));
        assert_eq!(upstream.take_opened().len(), 3);
        assert!(upstream.opened().is_empty());
    }

    #[test]
    fn test_fake_upstream_unknown_length_and_failures() {
        let resource = Resource::new(b"0123456789".to_vec())
            .with_unknown_length()
            .with_failure_from(6);
        let mut upstream = FakeUpstream::new().with_default(resource);
        assert_eq!(upstream.open(&Request::new("any", 2, None)).unwrap(), None);
        assert_eq!(
            upstream.open(&Request::new("any", 2, Some(3))).unwrap(),
            Some(3)
        );

        upstream.open(&Request::new("any", 0, None)).unwrap();
        let mut buf = [0; 4];
        assert_eq!(upstream.read(&mut buf).unwrap(), 4);
        assert!(upstream.read(&mut buf).is_err());
    }

    #[test]
    fn test_fake_upstream_clones_read_independently() {
        let mut a = FakeUpstream::new()
            .with_resource("a", b"aaaa".to_vec())
            .with_resource("b", b"bbbb".to_vec());
        let mut b = a.clone();
        a.open(&Request::new("a", 0, None)).unwrap();
        b.open(&Request::new("b", 1, None)).unwrap();

        let mut buf = [0; 4];
        assert_eq!(a.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"aaaa");
        assert_eq!(b.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"bbb");

        // Closing one clone leaves the other open
        b.close();
        assert!(b.read(&mut buf).is_err());
        assert_eq!(a.read(&mut buf).unwrap(), 0);
        assert_eq!(a.opened().len(), 2);
    }

    #[test]
    fn test_failing_storage() {
        let storage = FailingStorage::new(memory::Storage::default());
        let (blob, _) = storage.open("data", b"blob").unwrap();
        blob.write_at(b"data", 0).unwrap();

        // Faults apply to blobs that are already open
        storage.fail_writes("data");
        assert!(matches!(blob.write_at(b"x", 0), Err(StorageError::WriteFailed)));
        assert!(matches!(blob.sync(), Err(StorageError::WriteFailed)));
        let mut buf = [0; 4];
        blob.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"data");

        // Other partitions are unaffected
        let (other, _) = storage.open("other", b"blob").unwrap();
        other.write_at(b"data", 0).unwrap();

        storage.fail_opens("data");
        assert!(matches!(storage.open("data", b"blob"), Err(StorageError::ReadFailed)));

        storage.heal();
        let (blob, len) = storage.open("data", b"blob").unwrap();
        assert_eq!(len, 4);
        blob.write_at(b"more", 4).unwrap();
    }
}
