//! A disk-backed index of cached byte ranges.
//!
//! The [Cache] tracks, for every key, which byte ranges are cached (as immutable data spans, each
//! backed by one blob) and which ranges are currently being written (as holes). Any number of
//! readers may read data spans concurrently, but each region can only be written by the single
//! actor holding its [Hole](crate::Hole).
//!
//! # Locking
//!
//! [Cache::acquire] and [Cache::try_acquire] either return the data span covering an offset or
//! reserve the region from that offset up to the next known entry. A reservation is released with
//! [Cache::release] or consumed from the front with [Cache::commit]; both wake every actor waiting
//! in [Cache::acquire] (which then repeats its lookup from scratch). [Cache::query] never takes a
//! lock and reports held regions as gaps.
//!
//! # Writing
//!
//! A writer holding a hole calls [Cache::start_file] to create a blob for the front of the hole,
//! writes to it, and then calls [Cache::commit] to publish the written bytes as a data span.
//! Blobs of abandoned files are removed with [Cache::discard_file].
//!
//! # Persistence
//!
//! Span blobs are named after the key's numeric id, the span's start offset, and a sequence
//! number. Key ids and known total lengths are stored in two alternating metadata blobs, each
//! protected by a checksum. On [Cache::init], spans of unknown keys, empty spans, and spans that
//! overlap an older restored span are removed.
//!
//! # Eviction
//!
//! An [Evictor](crate::evictor::Evictor) is informed of every span added, touched, or removed and
//! may select spans to remove whenever a file is started or a span is committed. Removed spans
//! stay readable by readers that opened them before the removal.
//!
//! # Example
//!
//! ```rust
//! use span_cache::{
//!     cache::{Cache, Config},
//!     evictor::LeastRecentlyUsed,
//!     storage::{memory, Blob as _},
//!     Acquired,
//! };
//!
//! let cfg = Config::new("spans", "spans_metadata");
//! let cache = Cache::init(memory::Storage::default(), cfg, LeastRecentlyUsed::new(1 << 20)).unwrap();
//!
//! // Reserve the start of a resource
//! let Acquired::Hole(mut hole) = cache.acquire("resource", 0) else {
//!     unreachable!();
//! };
//!
//! // Write and commit 5 bytes
//! let (name, blob) = cache.start_file(&hole, 5).unwrap();
//! blob.write_at(b"hello", 0).unwrap();
//! blob.sync().unwrap();
//! let span = cache.commit(&mut hole, name, 5).unwrap();
//! cache.release(hole);
//!
//! assert_eq!(span.length(), 5);
//! assert!(cache.is_cached("resource", 0, 5));
//! ```

use prometheus_client::registry::Registry;
use std::sync::{Arc, Mutex};
use thiserror::Error;

mod metrics;
mod storage;

pub use metrics::Metrics;
pub use storage::Cache;

/// Errors that can occur when interacting with the cache.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::Error),
    #[error("hole exhausted")]
    HoleExhausted,
    #[error("hole not held")]
    HoleNotHeld,
    #[error("commit exceeds hole")]
    OutOfHole,
    #[error("empty commit")]
    EmptyCommit,
    #[error("too many keys")]
    TooManyKeys,
}

/// Configuration for [Cache].
#[derive(Clone)]
pub struct Config {
    /// The partition holding span blobs.
    pub partition: String,

    /// The partition holding key ids and lengths.
    pub metadata_partition: String,

    /// The registry metrics are registered with.
    pub registry: Arc<Mutex<Registry>>,
}

impl Config {
    /// Create a configuration registering metrics with a fresh [Registry].
    pub fn new(partition: impl Into<String>, metadata_partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            metadata_partition: metadata_partition.into(),
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }
}
