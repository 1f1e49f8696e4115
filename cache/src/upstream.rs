//! The origin of cached content.

use crate::source::Request;
use thiserror::Error;

/// Errors that can occur when reading from an [Upstream].
#[derive(Debug, Error)]
pub enum Error {
    /// The requested start is at or past the end of the resource.
    #[error("range not satisfiable")]
    RangeNotSatisfiable,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream error: {0}")]
    Other(String),
}

/// A source of bytes for resources identified by key.
///
/// At most one request is open at a time. The [crate::source::CachedSource] opens a new request
/// whenever it switches from a cached span to the gap that follows it, bounding the request to the
/// gap when the extent of the gap is known.
pub trait Upstream: Send {
    /// Open `request`, returning the number of bytes that can be read (if known).
    ///
    /// When `request.length` is set, the returned length never exceeds it. Fails with
    /// [Error::RangeNotSatisfiable] if `request.start` is at or past the end of the resource.
    fn open(&mut self, request: &Request) -> Result<Option<u64>, Error>;

    /// Read up to `buf.len()` bytes, returning 0 at the end of the opened range.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Close the open request (if any).
    fn close(&mut self);
}

impl<U: Upstream + ?Sized> Upstream for Box<U> {
    fn open(&mut self, request: &Request) -> Result<Option<u64>, Error> {
        (**self).open(request)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        (**self).read(buf)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
