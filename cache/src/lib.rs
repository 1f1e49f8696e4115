//! Serve byte ranges of remote resources from a disk-backed span cache.
//!
//! Resources (identified by a string key) are cached as a set of non-overlapping byte ranges
//! ("spans"), each stored in its own blob. A [Cache] may be shared by any number of concurrent
//! readers, while every uncached region can be written by at most one actor at a time (the holder
//! of the region's [Hole]).
//!
//! Most users will interact with the cache through a [source::CachedSource], which serves a
//! requested range from whatever is cached, fetches the rest from an [upstream::Upstream], and
//! (optionally) writes fetched bytes back into the cache as they are read.
//!
//! # Status
//!
//! `span-cache` is **ALPHA** software and is not yet recommended for production use. Developers
//! should expect breaking changes and occasional instability.

pub mod cache;
pub mod evictor;
pub(crate) mod index;
pub(crate) mod metadata;
pub mod mocks;
pub mod prime;
pub mod reader;
pub mod source;
pub mod span;
pub mod storage;
pub mod upstream;
pub mod writer;

pub use cache::Cache;
pub use evictor::Evictor;
pub use span::{Acquired, Hole, Lookup, Span};
