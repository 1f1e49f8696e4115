//! Policies deciding which spans to remove when the cache grows.
//!
//! The [Cache](crate::Cache) reports span lifecycle events to its [Evictor] while holding its
//! internal lock, so every callback observes a consistent view of the index. Callbacks that may
//! evict return the spans to remove; the cache removes them (reporting each through
//! [Evictor::on_span_removed]) before releasing the lock. Holes are never reported, so a held
//! reservation can never be selected.

use crate::span::Span;

mod lru;
mod noop;

pub use lru::LeastRecentlyUsed;
pub use noop::NoOp;

/// Eviction policy notified of span lifecycle events.
pub trait Evictor: Send + 'static {
    /// Called before a new blob of at most `max_length` bytes is started for `key` at `position`.
    ///
    /// Returns spans to remove to make room for it.
    fn on_start_file(&mut self, key: &str, position: u64, max_length: u64) -> Vec<Span> {
        let _ = (key, position, max_length);
        Vec::new()
    }

    /// Called when `span` is committed (or restored). Returns spans to remove.
    ///
    /// The returned spans must not include `span` itself.
    fn on_span_added(&mut self, span: &Span) -> Vec<Span>;

    /// Called when `span` is removed from the cache.
    fn on_span_removed(&mut self, span: &Span);

    /// Called when `old` is served and replaced by `new` (which differs only in its last touch).
    fn on_span_touched(&mut self, old: &Span, new: &Span);
}
