//! Persist a stream of bytes into a held [Hole], one bounded blob at a time.
//!
//! A [Writer] owns the [Hole] it writes into. Bytes are buffered in memory and written to the
//! current blob whenever the buffer fills. Once a blob holds `max_file_size` bytes it is committed
//! to the [Cache] (becoming readable by everyone) and the next byte starts a new blob at the
//! following offset of the same, now shrunk, hole.
//!
//! If any operation fails, the blob in progress is discarded and the hole is released before the
//! error is returned. Spans committed before the failure remain in the cache.

use crate::{
    cache::{Cache, Error},
    span::{Hole, Span},
    storage::{Blob as _, Storage},
};
use bytes::BytesMut;
use std::num::{NonZeroU64, NonZeroUsize};
use tracing::{debug, trace, warn};

/// Configuration for [Writer].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// The maximum number of bytes held by a single blob (and therefore by a single span).
    pub max_file_size: NonZeroU64,

    /// The number of bytes buffered before they are written to the current blob.
    pub buffer_size: NonZeroUsize,

    /// Whether to sync each blob before committing it.
    pub sync: bool,
}

/// The blob currently being written.
struct File<B> {
    name: Vec<u8>,
    blob: B,

    // Bytes written to the blob
    flushed: u64,

    // Bytes assigned to the blob (flushed or buffered)
    length: u64,
}

/// Writes bytes at the front of a [Hole], committing a span for every completed blob.
pub struct Writer<S: Storage> {
    cache: Cache<S>,
    cfg: Config,

    hole: Option<Hole>,
    file: Option<File<S::Blob>>,
    buffer: BytesMut,

    committed: Vec<Span>,
}

impl<S: Storage> Writer<S> {
    /// Create a [Writer] that writes into `hole`, starting at its first byte.
    pub fn new(cache: Cache<S>, cfg: Config, hole: Hole) -> Self {
        Self {
            cache,
            buffer: BytesMut::with_capacity(cfg.buffer_size.get()),
            cfg,
            hole: Some(hole),
            file: None,
            committed: Vec::new(),
        }
    }

    /// Returns the offset the next written byte will be stored at.
    pub fn position(&self) -> Option<u64> {
        let hole = self.hole.as_ref()?;
        Some(hole.start() + self.file.as_ref().map_or(0, |file| file.length))
    }

    /// Returns the spans committed so far.
    pub fn committed(&self) -> &[Span] {
        &self.committed
    }

    /// Append `data` to the cached content.
    ///
    /// Fails with [Error::OutOfHole] if `data` does not fit in the remainder of the hole.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let result = self.write_inner(data);
        if let Err(err) = &result {
            warn!(?err, "failed to write to cache");
            self.abandon();
        }
        result
    }

    fn write_inner(&mut self, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let hole = self.hole.as_ref().ok_or(Error::HoleNotHeld)?;
            if self.file.is_none() {
                if hole.is_exhausted() {
                    return Err(Error::OutOfHole);
                }
                let max_length = hole.length().map_or(self.cfg.max_file_size.get(), |length| {
                    length.min(self.cfg.max_file_size.get())
                });
                let (name, blob) = self.cache.start_file(hole, max_length)?;
                self.file = Some(File {
                    name,
                    blob,
                    flushed: 0,
                    length: 0,
                });
            }
            let hole_length = hole.length();
            let file = self.file.as_mut().ok_or(Error::HoleNotHeld)?;

            // Bound the chunk by the blob and the hole
            let mut room = self.cfg.max_file_size.get() - file.length;
            if let Some(length) = hole_length {
                room = room.min(length - file.length);
            }
            if room == 0 {
                return Err(Error::OutOfHole);
            }
            let chunk = room.min(data.len() as u64) as usize;
            file.length += chunk as u64;
            let length = file.length;
            self.buffer.extend_from_slice(&data[..chunk]);
            data = &data[chunk..];

            if self.buffer.len() >= self.cfg.buffer_size.get() {
                self.flush()?;
            }
            if length == self.cfg.max_file_size.get() || hole_length == Some(length) {
                self.commit()?;
            }
        }
        Ok(())
    }

    /// Write buffered bytes to the current blob.
    fn flush(&mut self) -> Result<(), Error> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        if self.buffer.is_empty() {
            return Ok(());
        }
        file.blob.write_at(&self.buffer, file.flushed)?;
        file.flushed += self.buffer.len() as u64;
        trace!(name = ?file.name, flushed = file.flushed, "flushed buffer");
        self.buffer.clear();
        Ok(())
    }

    /// Commit the current blob (if it holds any bytes) as a span.
    fn commit(&mut self) -> Result<(), Error> {
        self.flush()?;
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        if file.length == 0 {
            self.cache.discard_file(&file.name)?;
            return Ok(());
        }
        match self.commit_file(&file) {
            Ok(span) => {
                debug!(
                    key = span.key(),
                    start = span.start(),
                    length = span.length(),
                    "committed file"
                );
                self.committed.push(span);
                Ok(())
            }
            Err(err) => {
                // Put the file back so it is discarded by the caller
                self.file = Some(file);
                Err(err)
            }
        }
    }

    fn commit_file(&mut self, file: &File<S::Blob>) -> Result<Span, Error> {
        if self.cfg.sync {
            file.blob.sync()?;
        }
        let hole = self.hole.as_mut().ok_or(Error::HoleNotHeld)?;
        self.cache.commit(hole, file.name.clone(), file.length)
    }

    /// Commit all written bytes and release the remainder of the hole, returning every span
    /// committed by this writer.
    pub fn close(mut self) -> Result<Vec<Span>, Error> {
        if let Err(err) = self.commit() {
            warn!(?err, "failed to commit final file");
            self.abandon();
            return Err(err);
        }
        if let Some(hole) = self.hole.take() {
            self.cache.release(hole);
        }
        Ok(std::mem::take(&mut self.committed))
    }

    /// Discard any uncommitted bytes and release the hole.
    pub fn abandon(&mut self) {
        self.buffer.clear();
        if let Some(file) = self.file.take() {
            if let Err(err) = self.cache.discard_file(&file.name) {
                warn!(?err, "failed to discard file");
            }
        }
        if let Some(hole) = self.hole.take() {
            self.cache.release(hole);
        }
    }
}

impl<S: Storage> Drop for Writer<S> {
    fn drop(&mut self) {
        self.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::Config as CacheConfig,
        evictor::NoOp,
        span::Acquired,
        storage::memory,
    };
    use commonware_macros::test_traced;
    use rand::{rngs::StdRng, RngCore, SeedableRng};
    use std::num::{NonZeroU64, NonZeroUsize};
    use test_case::test_case;

    fn init() -> (memory::Storage, Cache<memory::Storage>) {
        let storage = memory::Storage::default();
        let cache = Cache::init(
            storage.clone(),
            CacheConfig::new("spans", "spans_metadata"),
            NoOp,
        )
        .unwrap();
        (storage, cache)
    }

    fn hole(cache: &Cache<memory::Storage>, key: &str, offset: u64) -> Hole {
        match cache.acquire(key, offset) {
            Acquired::Hole(hole) => hole,
            Acquired::Cached(span) => panic!("unexpected span: {span:?}"),
        }
    }

    fn read(cache: &Cache<memory::Storage>, span: &Span) -> Vec<u8> {
        let (blob, len) = cache.open_span(span).unwrap().unwrap();
        let mut buf = vec![0; len as usize];
        blob.read_at(&mut buf, 0).unwrap();
        buf
    }

    #[test_case(3, 10, &[3, 3, 3, 1]; "uneven")]
    #[test_case(5, 10, &[5, 5]; "even")]
    #[test_case(100, 10, &[10]; "single")]
    #[test_case(1, 3, &[1, 1, 1]; "byte per file")]
    fn test_writer_splits_files(max_file_size: u64, total: usize, expected: &[u64]) {
        let (_, cache) = init();
        let cfg = Config {
            max_file_size: NonZeroU64::new(max_file_size).unwrap(),
            buffer_size: NonZeroUsize::new(2).unwrap(),
            sync: true,
        };
        let mut writer = Writer::new(cache.clone(), cfg, hole(&cache, "key", 7));

        // Write in uneven chunks
        let mut data = vec![0u8; total];
        StdRng::seed_from_u64(0).fill_bytes(&mut data);
        for chunk in data.chunks(4) {
            writer.write(chunk).unwrap();
        }
        let spans = writer.close().unwrap();

        let lengths: Vec<u64> = spans.iter().map(|span| span.length()).collect();
        assert_eq!(lengths, expected);
        let mut offset = 7;
        let mut content = Vec::new();
        for span in &spans {
            assert_eq!(span.start(), offset);
            offset = span.end();
            content.extend(read(&cache, span));
        }
        assert_eq!(content, data);
        assert_eq!(cache.spans("key"), spans);

        // The remainder of the hole was released
        assert!(cache.try_acquire("key", offset).is_some());
    }

    #[test_traced]
    fn test_writer_commits_full_files_before_close() {
        let (_, cache) = init();
        let cfg = Config {
            max_file_size: NonZeroU64::new(4).unwrap(),
            buffer_size: NonZeroUsize::new(1024).unwrap(),
            sync: false,
        };
        let mut writer = Writer::new(cache.clone(), cfg, hole(&cache, "key", 0));
        writer.write(b"abcdef").unwrap();
        assert_eq!(writer.committed().len(), 1);
        assert_eq!(writer.position(), Some(6));
        assert!(cache.is_cached("key", 0, 4));
        assert!(!cache.is_cached("key", 4, 1));

        // The region being written is still held
        assert!(cache.try_acquire("key", 5).is_none());
        writer.close().unwrap();
        assert!(cache.is_cached("key", 0, 6));
    }

    #[test_traced]
    fn test_writer_respects_hole_bound() {
        let (_, cache) = init();
        let mut tail = hole(&cache, "key", 5);
        let (name, blob) = cache.start_file(&tail, 1).unwrap();
        blob.write_at(b"x", 0).unwrap();
        cache.commit(&mut tail, name, 1).unwrap();
        cache.release(tail);

        let cfg = Config {
            max_file_size: NonZeroU64::new(100).unwrap(),
            buffer_size: NonZeroUsize::new(16).unwrap(),
            sync: false,
        };
        let mut writer = Writer::new(cache.clone(), cfg, hole(&cache, "key", 0));
        writer.write(b"hello").unwrap();
        assert_eq!(writer.committed().len(), 1);

        // Writing past the hole fails and releases it
        assert!(matches!(writer.write(b"!"), Err(Error::OutOfHole)));
        assert!(matches!(writer.write(b"!"), Err(Error::HoleNotHeld)));
        assert_eq!(writer.close().unwrap().len(), 1);
        assert_eq!(cache.cached_bytes("key", 0, None), 6);
    }

    #[test_traced]
    fn test_writer_abandon_discards_partial_file() {
        let (storage, cache) = init();
        let cfg = Config {
            max_file_size: NonZeroU64::new(4).unwrap(),
            buffer_size: NonZeroUsize::new(1).unwrap(),
            sync: false,
        };
        let mut writer = Writer::new(cache.clone(), cfg, hole(&cache, "key", 0));
        writer.write(b"abcdef").unwrap();
        drop(writer);

        // Only the completed file survives
        assert_eq!(cache.cached_bytes("key", 0, None), 4);
        assert_eq!(storage.scan("spans").unwrap().len(), 1);
        assert!(cache.try_acquire("key", 4).is_some());
    }
}
