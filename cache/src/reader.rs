//! Stream the bytes of a data [Span] from its blob.

use crate::{
    cache::{self, Cache},
    span::Span,
    storage::{Blob as _, Error as StorageError, Storage},
};
use thiserror::Error;
use tracing::{trace, warn};

/// Errors that can occur when reading a span.
#[derive(Debug, Error)]
pub enum Error {
    #[error("backing file of {key}@{start} truncated: expected {expected} bytes, found {found}")]
    BackingFileTruncated {
        key: String,
        start: u64,
        expected: u64,
        found: u64,
    },
    #[error("cache error: {0}")]
    Cache(#[from] cache::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Reads a data [Span] from an offset up to a bound.
///
/// The blob is opened once, so the reader keeps working if the span is removed while it is read.
pub struct Reader<S: Storage> {
    span: Span,
    blob: S::Blob,

    position: u64,
    end: u64,
}

impl<S: Storage> Reader<S> {
    /// Open `span` for reading from `position`, serving at most `limit` bytes (if provided).
    ///
    /// Returns `None` if the span is no longer in the cache or does not contain `position`.
    pub fn open(
        cache: &Cache<S>,
        span: &Span,
        position: u64,
        limit: Option<u64>,
    ) -> Result<Option<Self>, Error> {
        if !span.contains(position) {
            return Ok(None);
        }
        let Some((blob, len)) = cache.open_span(span)? else {
            trace!(key = span.key(), start = span.start(), "span removed before open");
            return Ok(None);
        };
        if len < span.length() {
            warn!(
                key = span.key(),
                start = span.start(),
                expected = span.length(),
                found = len,
                "backing file truncated"
            );
            return Err(Error::BackingFileTruncated {
                key: span.key().to_string(),
                start: span.start(),
                expected: span.length(),
                found: len,
            });
        }
        let end = match limit.and_then(|limit| position.checked_add(limit)) {
            Some(end) => end.min(span.end()),
            None => span.end(),
        };
        Ok(Some(Self {
            span: span.clone(),
            blob,
            position,
            end,
        }))
    }

    /// The span being read.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Offset of the next byte to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Offset one past the last byte this reader will serve.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Read up to `buf.len()` bytes, returning 0 once the bound is reached.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let remaining = self.end - self.position;
        let n = remaining.min(buf.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }
        match self
            .blob
            .read_at(&mut buf[..n], self.position - self.span.start())
        {
            Ok(()) => {}
            Err(StorageError::BlobInsufficientLength) => {
                return Err(Error::BackingFileTruncated {
                    key: self.span.key().to_string(),
                    start: self.span.start(),
                    expected: self.span.length(),
                    found: self.position - self.span.start(),
                });
            }
            Err(err) => return Err(err.into()),
        }
        self.position += n as u64;
        Ok(n)
    }
}
