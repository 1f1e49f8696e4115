//! Serve byte ranges of a resource from the [Cache](crate::Cache), falling back to an
//! [Upstream](crate::upstream::Upstream) for anything not cached.
//!
//! A [CachedSource] serves one [Request] at a time. Starting at the requested offset, it looks the
//! offset up in the cache: cached bytes are streamed from the covering span, while missing bytes
//! are fetched from upstream (bounded to the gap before the next cached span) and, when a writer
//! is configured and the region could be locked, copied into the cache as they are read. Whenever
//! a span or gap is exhausted the source looks up the next offset and switches transparently.
//!
//! # Content Length
//!
//! The total length of a resource is only persisted once it is certain:
//! * when an unbounded upstream read reaches the end of the resource,
//! * when upstream rejects a request at a position reached while switching sources, or
//! * when upstream reports the length of an unbounded request.
//!
//! Reaching the end of a gap (or of a cached span) says nothing about the resource length.
//!
//! # Example
//!
//! ```rust
//! use span_cache::{
//!     cache::{Cache, Config as CacheConfig},
//!     evictor::NoOp,
//!     mocks::FakeUpstream,
//!     source::{CachedSource, Config, Request},
//!     storage::memory,
//!     writer,
//! };
//! use std::num::{NonZeroU64, NonZeroUsize};
//!
//! let cache = Cache::init(
//!     memory::Storage::default(),
//!     CacheConfig::new("spans", "spans_metadata"),
//!     NoOp,
//! )
//! .unwrap();
//! let upstream = FakeUpstream::new().with_resource("resource", b"hello world".to_vec());
//! let cfg = Config::new(Some(writer::Config {
//!     max_file_size: NonZeroU64::new(4).unwrap(),
//!     buffer_size: NonZeroUsize::new(1024).unwrap(),
//!     sync: false,
//! }));
//!
//! // Read everything (populating the cache)
//! let mut source = CachedSource::new(cache.clone(), upstream, cfg);
//! assert_eq!(source.open(Request::new("resource", 0, None)).unwrap(), Some(11));
//! let mut buf = [0; 32];
//! let mut read = 0;
//! loop {
//!     let n = source.read(&mut buf[read..]).unwrap();
//!     if n == 0 {
//!         break;
//!     }
//!     read += n;
//! }
//! source.close();
//!
//! assert_eq!(&buf[..read], b"hello world");
//! assert_eq!(cache.length("resource"), Some(11));
//! assert!(cache.is_cached("resource", 0, 11));
//! ```

use crate::{cache, reader, upstream, writer};
use std::num::NonZeroU64;
use thiserror::Error;

mod cached;

pub use cached::CachedSource;

/// Default number of bytes read from upstream (without a lock) between cache re-checks.
pub const DEFAULT_RECHECK_INTERVAL: u64 = 100 * 1024;

/// Errors that can occur when reading through a [CachedSource].
#[derive(Debug, Error)]
pub enum Error {
    #[error("range not satisfiable: start={start} length={length:?}")]
    UnsatisfiableRange { start: u64, length: Option<u64> },
    #[error("backing file of {key}@{start} truncated: expected {expected} bytes, found {found}")]
    BackingFileTruncated {
        key: String,
        start: u64,
        expected: u64,
        found: u64,
    },
    #[error("upstream error: {0}")]
    Upstream(#[from] upstream::Error),
    #[error("cache error: {0}")]
    Cache(#[from] cache::Error),
    #[error("source closed")]
    Closed,
}

impl From<reader::Error> for Error {
    fn from(err: reader::Error) -> Self {
        match err {
            reader::Error::BackingFileTruncated {
                key,
                start,
                expected,
                found,
            } => Self::BackingFileTruncated {
                key,
                start,
                expected,
                found,
            },
            reader::Error::Cache(err) => Self::Cache(err),
            reader::Error::Storage(err) => Self::Cache(err.into()),
        }
    }
}

/// Options of a [Request].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// Wait for regions locked by other writers instead of reading them from upstream.
    pub block_on_contention: bool,

    /// Bypass the cache entirely for requests without a length.
    pub ignore_cache_if_length_unset: bool,

    /// Write to the cache even when the length of the upstream read is unknown.
    pub allow_cache_while_length_unknown: bool,
}

/// A range of a resource to read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    /// The key of the resource.
    pub key: String,

    /// Offset of the first byte to read.
    pub start: u64,

    /// Number of bytes to read (`None` reads until the end of the resource).
    pub length: Option<u64>,

    /// Options of the request.
    pub flags: Flags,
}

impl Request {
    /// Create a request with default [Flags].
    pub fn new(key: impl Into<String>, start: u64, length: Option<u64>) -> Self {
        Self {
            key: key.into(),
            start,
            length,
            flags: Flags::default(),
        }
    }

    /// Create a request where a negative `length` means unbounded.
    pub fn from_signed(key: impl Into<String>, start: u64, length: i64, flags: Flags) -> Self {
        Self {
            key: key.into(),
            start,
            length: u64::try_from(length).ok(),
            flags,
        }
    }

    /// Replace the [Flags] of the request.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Returns the request for `length` bytes of the same resource starting at `start`.
    pub(crate) fn subrange(&self, start: u64, length: Option<u64>) -> Self {
        Self {
            key: self.key.clone(),
            start,
            length,
            flags: self.flags,
        }
    }
}

/// Configuration for [CachedSource].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Configuration of the writer copying upstream bytes into the cache (`None` never writes to
    /// the cache).
    pub writer: Option<writer::Config>,

    /// Number of bytes read from upstream without a lock after which the cache is checked again
    /// for the current position.
    pub recheck_interval: NonZeroU64,
}

impl Config {
    /// Create a configuration with the default re-check interval.
    pub fn new(writer: Option<writer::Config>) -> Self {
        Self {
            writer,
            recheck_interval: NonZeroU64::new(DEFAULT_RECHECK_INTERVAL)
                .unwrap_or(NonZeroU64::MIN),
        }
    }

    /// Create a configuration that never writes to the cache.
    pub fn read_only() -> Self {
        Self::new(None)
    }
}

/// Bytes served by a [CachedSource] since it was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bytes served from cached spans.
    pub cached: u64,

    /// Bytes served from upstream.
    pub upstream: u64,
}
