//! Byte ranges tracked by the [Cache](crate::Cache).

/// A committed, immutable range of cached bytes for a key, backed by exactly one blob.
///
/// Data spans are safe to read concurrently without synchronization. A [Span] is a snapshot: it
/// stays usable (and its blob readable, see [crate::storage]) even after the cache removes it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Span {
    pub(crate) key: String,
    pub(crate) start: u64,
    pub(crate) length: u64,
    pub(crate) name: Vec<u8>,
    pub(crate) last_touch: u64,
}

impl Span {
    /// The key of the resource this span belongs to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Offset of the first byte held by this span.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Number of bytes held by this span.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Offset one past the last byte held by this span.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Name of the backing blob.
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Logical time at which the span was last committed or served.
    pub fn last_touch(&self) -> u64 {
        self.last_touch
    }

    /// Returns true if `offset` falls within this span.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }
}

/// An exclusive reservation over `[start, end)` of a key that holds no data.
///
/// A [Hole] is the write lock for its region: while it is held, no other actor can acquire any
/// byte of it. It is released with [Cache::release](crate::Cache::release) or shrunk from the
/// front by [Cache::commit](crate::Cache::commit). The token cannot be cloned, so a region can
/// only be released once.
#[derive(Debug)]
pub struct Hole {
    pub(crate) key: String,
    pub(crate) id: u64,
    pub(crate) start: u64,
    pub(crate) end: Option<u64>,
}

impl Hole {
    /// The key of the resource this hole belongs to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Offset of the first reserved byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Offset one past the last reserved byte (`None` if the reservation is unbounded).
    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Number of reserved bytes (`None` if the reservation is unbounded).
    pub fn length(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    /// Returns true if every reserved byte has been committed.
    pub fn is_exhausted(&self) -> bool {
        self.end == Some(self.start)
    }
}

/// Result of looking up an offset without taking a lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// A data span covers the offset.
    Cached(Span),
    /// No data covers the offset; the next data span (if any) starts at `end`.
    Gap { end: Option<u64> },
}

/// Result of acquiring an offset for reading or writing.
#[derive(Debug)]
pub enum Acquired {
    /// A data span covers the offset and can be read without a lock.
    Cached(Span),
    /// No data covers the offset and the caller now exclusively holds the reservation.
    Hole(Hole),
}
