//! Populate the [Cache] ahead of time.

use crate::{
    cache::{Cache, Error as CacheError},
    source::{CachedSource, Config, Error, Flags, Request},
    span::Lookup,
    storage::Storage,
    upstream::Upstream,
    writer,
};
use tracing::{debug, warn};

/// Size of the buffer bytes are read into (and discarded from) while priming.
const BUFFER_SIZE: usize = 16 * 1024;

/// Progress of [prime].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Bytes of the range that were already cached.
    pub already_cached: u64,

    /// Bytes of the range fetched from upstream (and cached).
    pub newly_cached: u64,

    /// Length of the range (if known).
    pub content_length: Option<u64>,
}

impl Counters {
    /// Total bytes of the range that are now cached.
    pub fn total_cached(&self) -> u64 {
        self.already_cached + self.newly_cached
    }
}

/// Cache all of `request` that is not already cached, fetching gaps from `upstream`.
///
/// Gaps are read through a blocking [CachedSource], so regions being written by others are waited
/// for rather than fetched twice.
pub fn prime<S: Storage, U: Upstream>(
    cache: &Cache<S>,
    upstream: U,
    cfg: writer::Config,
    request: &Request,
) -> Result<Counters, Error> {
    let mut counters = Counters {
        content_length: request.length.or_else(|| {
            cache
                .length(&request.key)
                .map(|total| total.saturating_sub(request.start))
        }),
        ..Default::default()
    };
    let flags = Flags {
        block_on_contention: true,
        ignore_cache_if_length_unset: false,
        allow_cache_while_length_unknown: true,
    };
    let mut source = CachedSource::new(cache.clone(), upstream, Config::new(Some(cfg)));
    let mut buf = vec![0; BUFFER_SIZE];
    let mut position = request.start;
    loop {
        let remaining = counters
            .content_length
            .map(|length| request.start + length - position);
        if remaining == Some(0) {
            break;
        }

        // Skip what is already cached
        let cached = cache.cached_bytes(&request.key, position, remaining);
        if cached > 0 {
            counters.already_cached += cached;
            position += cached;
            continue;
        }

        // Fetch the gap
        let gap = match cache.query(&request.key, position) {
            Lookup::Gap { end } => end.map(|end| end - position),
            Lookup::Cached(_) => continue,
        };
        let length = match (remaining, gap) {
            (Some(remaining), Some(gap)) => Some(remaining.min(gap)),
            (remaining, gap) => remaining.or(gap),
        };
        let sub = Request {
            key: request.key.clone(),
            start: position,
            length,
            flags,
        };
        match source.open(sub) {
            Ok(_) => {}
            Err(Error::UnsatisfiableRange { .. }) if position > request.start => {
                // The resource ends where the cached data ends
                if let Err(err) = cache.set_length(&request.key, position) {
                    warn!(key = request.key, position, ?err, "failed to persist length");
                }
                counters.content_length = Some(position - request.start);
                break;
            }
            Err(err) => return Err(err),
        }
        let before = source.stats();
        let mut read = 0;
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            read += n as u64;
        }
        source.close();
        let after = source.stats();
        counters.newly_cached += after.upstream - before.upstream;
        counters.already_cached += after.cached - before.cached;
        position += read;

        // Stop at the end of the resource
        if length.map_or(true, |length| read < length) {
            counters.content_length = Some(position - request.start);
            break;
        }
    }
    debug!(
        key = request.key,
        start = request.start,
        already_cached = counters.already_cached,
        newly_cached = counters.newly_cached,
        "primed range"
    );
    Ok(counters)
}

/// Remove every cached span of `key`, returning how many were removed.
pub fn remove_all<S: Storage>(cache: &Cache<S>, key: &str) -> Result<usize, CacheError> {
    let mut removed = 0;
    for span in cache.spans(key) {
        if cache.remove(&span)? {
            removed += 1;
        }
    }
    debug!(key, removed, "removed all spans");
    Ok(removed)
}
