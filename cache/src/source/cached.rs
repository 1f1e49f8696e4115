use super::{Config, Error, Request, Stats};
use crate::{
    cache::Cache,
    reader::{Error as ReaderError, Reader},
    span::{Acquired, Hole, Lookup},
    storage::Storage,
    upstream::{Error as UpstreamError, Upstream},
    writer::Writer,
};
use std::mem;
use tracing::{debug, trace, warn};

/// How to treat regions locked by other writers during a lookup.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Wait until the region is released.
    Wait,
    /// Read the region from upstream without a lock.
    Skip,
}

/// The next sub-source, as determined by a cache lookup.
enum Next<S: Storage> {
    /// Serve from a cached span.
    Cached(Reader<S>),
    /// Read from upstream into a region this source now holds.
    Hole(Hole),
    /// Read from upstream without a lock, up to `end` (if known).
    Gap { end: Option<u64> },
}

/// An open upstream sub-request.
struct Fetch<S: Storage> {
    // Bytes the sub-request will produce (if known)
    length: Option<u64>,

    // Bytes produced so far
    read: u64,

    // Held region (if not owned by the writer)
    hole: Option<Hole>,
    writer: Option<Writer<S>>,

    // Position at which to look for new cached data (only set without a lock)
    recheck_at: Option<u64>,
}

impl<S: Storage> Fetch<S> {
    fn is_locked(&self) -> bool {
        self.hole.is_some() || self.writer.is_some()
    }
}

/// The active sub-source.
enum Source<S: Storage> {
    Cache(Reader<S>),
    Upstream(Fetch<S>),
}

/// An open request.
struct Reading<S: Storage> {
    request: Request,
    ignore_cache: bool,

    // Offset of the next byte to serve
    position: u64,

    // Bytes left to serve (if known)
    remaining: Option<u64>,

    source: Option<Source<S>>,
}

enum State<S: Storage> {
    Idle,
    Reading(Reading<S>),
    Exhausted,
}

/// Reads a [Request] from the [Cache], falling back to (and optionally caching) an [Upstream].
///
/// See [crate::source] for the switching and length rules.
pub struct CachedSource<S: Storage, U: Upstream> {
    cache: Cache<S>,
    upstream: U,
    cfg: Config,

    state: State<S>,
    stats: Stats,
}

impl<S: Storage, U: Upstream> CachedSource<S, U> {
    /// Create a new, idle source.
    pub fn new(cache: Cache<S>, upstream: U, cfg: Config) -> Self {
        Self {
            cache,
            upstream,
            cfg,
            state: State::Idle,
            stats: Stats::default(),
        }
    }

    /// Bytes served so far.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Returns the upstream of this source.
    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    /// Open `request`, returning the number of bytes that will be served (if known).
    ///
    /// Any previously opened request is closed first.
    pub fn open(&mut self, request: Request) -> Result<Option<u64>, Error> {
        self.close();

        let unsatisfiable = Error::UnsatisfiableRange {
            start: request.start,
            length: request.length,
        };
        if request.length == Some(0) {
            return Err(unsatisfiable);
        }
        let ignore_cache =
            request.flags.ignore_cache_if_length_unset && request.length.is_none();
        let known = if ignore_cache {
            None
        } else {
            self.cache.length(&request.key)
        };
        if let Some(total) = known {
            if request.start >= total {
                debug!(key = request.key, start = request.start, total, "range past end");
                return Err(unsatisfiable);
            }
        }
        let remaining = request
            .length
            .or_else(|| known.map(|total| total - request.start));

        let mut reading = Reading {
            position: request.start,
            request,
            ignore_cache,
            remaining,
            source: None,
        };
        let mode = if reading.request.flags.block_on_contention {
            Mode::Wait
        } else {
            Mode::Skip
        };
        let result = self
            .lookup(&reading, mode)
            .and_then(|next| self.start(&mut reading, next));
        if let Err(err) = result {
            self.finish(&mut reading);
            return match err {
                Error::Upstream(UpstreamError::RangeNotSatisfiable) => Err(unsatisfiable),
                err => Err(err),
            };
        }
        debug!(
            key = reading.request.key,
            start = reading.request.start,
            remaining = ?reading.remaining,
            "opened request"
        );
        let remaining = reading.remaining;
        self.state = if reading.source.is_some() {
            State::Reading(reading)
        } else {
            State::Exhausted
        };
        Ok(remaining)
    }

    /// Read up to `buf.len()` bytes, returning 0 at the end of the request.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut reading = match mem::replace(&mut self.state, State::Idle) {
            State::Idle => return Err(Error::Closed),
            State::Exhausted => {
                self.state = State::Exhausted;
                return Ok(0);
            }
            State::Reading(reading) => reading,
        };
        if buf.is_empty() {
            self.state = State::Reading(reading);
            return Ok(0);
        }
        match self.read_inner(&mut reading, buf) {
            Ok(0) => {
                self.finish(&mut reading);
                self.state = State::Exhausted;
                Ok(0)
            }
            Ok(n) => {
                self.state = State::Reading(reading);
                Ok(n)
            }
            Err(err) => {
                warn!(key = reading.request.key, position = reading.position, ?err, "read failed");
                self.finish(&mut reading);
                Err(err)
            }
        }
    }

    /// Close the open request (if any), committing cached bytes and releasing held regions.
    ///
    /// Failures to commit are logged, as caching is best effort.
    pub fn close(&mut self) {
        if let State::Reading(mut reading) = mem::replace(&mut self.state, State::Idle) {
            self.finish(&mut reading);
        }
    }

    fn read_inner(&mut self, reading: &mut Reading<S>, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            if reading.remaining == Some(0) {
                return Ok(0);
            }
            let want = reading
                .remaining
                .map_or(buf.len(), |remaining| remaining.min(buf.len() as u64) as usize);
            match reading.source.as_mut() {
                None => return Ok(0),
                Some(Source::Cache(reader)) => {
                    let n = match reader.read(&mut buf[..want]) {
                        Ok(n) => n,
                        Err(err @ ReaderError::BackingFileTruncated { .. }) => {
                            return Err(err.into())
                        }
                        Err(err) => {
                            // Serve the rest of the span from upstream
                            warn!(
                                key = reading.request.key,
                                position = reading.position,
                                ?err,
                                "failed to read span"
                            );
                            let end = reader.span().end();
                            self.close_source(reading);
                            self.start(reading, Next::Gap { end: Some(end) })?;
                            continue;
                        }
                    };
                    if n > 0 {
                        self.advance(reading, n);
                        self.stats.cached += n as u64;
                        self.cache.metrics().cache_reads.inc_by(n as u64);
                        return Ok(n);
                    }
                    self.switch(reading)?;
                }
                Some(Source::Upstream(fetch)) => {
                    // Look for data cached by other writers meanwhile
                    if fetch
                        .recheck_at
                        .is_some_and(|recheck_at| reading.position >= recheck_at)
                    {
                        self.recheck(reading)?;
                        continue;
                    }

                    let want = fetch
                        .length
                        .map_or(want, |length| (length - fetch.read).min(want as u64) as usize);
                    let n = if want == 0 {
                        0
                    } else {
                        self.upstream.read(&mut buf[..want])?
                    };
                    if n > 0 {
                        fetch.read += n as u64;
                        if let Some(writer) = fetch.writer.as_mut() {
                            if let Err(err) = writer.write(&buf[..n]) {
                                // The writer released its hole, so stop caching
                                warn!(key = reading.request.key, ?err, "stopped caching");
                                fetch.writer = None;
                                fetch.recheck_at =
                                    Some(reading.position + self.cfg.recheck_interval.get());
                            }
                        }
                        self.advance(reading, n);
                        self.stats.upstream += n as u64;
                        self.cache.metrics().upstream_reads.inc_by(n as u64);
                        return Ok(n);
                    }

                    // Upstream ended before producing everything it could (or was unbounded)
                    if fetch.length.is_none() || fetch.read == 0 {
                        let locked = fetch.is_locked();
                        self.end_of_resource(reading, locked);
                        return Ok(0);
                    }
                    self.switch(reading)?;
                }
            }
        }
    }

    /// Record `n` served bytes.
    fn advance(&self, reading: &mut Reading<S>, n: usize) {
        reading.position += n as u64;
        if let Some(remaining) = reading.remaining.as_mut() {
            *remaining -= n as u64;
        }
    }

    /// Close the exhausted sub-source and open the next one.
    fn switch(&mut self, reading: &mut Reading<S>) -> Result<(), Error> {
        self.close_source(reading);
        if reading.remaining == Some(0) {
            return Ok(());
        }
        trace!(key = reading.request.key, position = reading.position, "switching source");
        let mode = if reading.request.flags.block_on_contention {
            Mode::Wait
        } else {
            Mode::Skip
        };
        let next = self.lookup(reading, mode)?;
        match self.start(reading, next) {
            Err(Error::Upstream(UpstreamError::RangeNotSatisfiable)) => {
                self.end_of_resource(reading, true);
                Ok(())
            }
            result => result,
        }
    }

    /// Check whether the current position became cached (or lockable) while reading upstream
    /// without a lock, switching to it if so.
    fn recheck(&mut self, reading: &mut Reading<S>) -> Result<(), Error> {
        let next = self.lookup(reading, Mode::Skip)?;
        if let Next::Gap { .. } = next {
            if let Some(Source::Upstream(fetch)) = reading.source.as_mut() {
                fetch.recheck_at = Some(reading.position + self.cfg.recheck_interval.get());
            }
            return Ok(());
        }
        debug!(key = reading.request.key, position = reading.position, "cache changed");
        self.close_source(reading);
        match self.start(reading, next) {
            Err(Error::Upstream(UpstreamError::RangeNotSatisfiable)) => {
                self.end_of_resource(reading, true);
                Ok(())
            }
            result => result,
        }
    }

    /// Determine what covers the current position.
    fn lookup(&self, reading: &Reading<S>, mode: Mode) -> Result<Next<S>, Error> {
        if reading.ignore_cache {
            return Ok(Next::Gap { end: None });
        }
        let key = &reading.request.key;
        let position = reading.position;
        loop {
            let span = if self.cfg.writer.is_none() {
                match self.cache.query(key, position) {
                    Lookup::Cached(span) => span,
                    Lookup::Gap { end } => return Ok(Next::Gap { end }),
                }
            } else {
                let acquired = match mode {
                    Mode::Wait => Some(self.cache.acquire(key, position)),
                    Mode::Skip => self.cache.try_acquire(key, position),
                };
                match acquired {
                    Some(Acquired::Cached(span)) => span,
                    Some(Acquired::Hole(hole)) => return Ok(Next::Hole(hole)),
                    None => match self.cache.query(key, position) {
                        Lookup::Cached(span) => span,
                        Lookup::Gap { end } => return Ok(Next::Gap { end }),
                    },
                }
            };
            match Reader::open(&self.cache, &span, position, reading.remaining) {
                Ok(Some(reader)) => return Ok(Next::Cached(reader)),
                Ok(None) => {
                    trace!(key, position, "span removed during lookup");
                    continue;
                }
                Err(err @ ReaderError::BackingFileTruncated { .. }) => return Err(err.into()),
                Err(err) => {
                    warn!(key, position, ?err, "failed to open span");
                    return Ok(Next::Gap {
                        end: Some(span.end()),
                    });
                }
            }
        }
    }

    /// Install `next` as the active sub-source.
    fn start(&mut self, reading: &mut Reading<S>, next: Next<S>) -> Result<(), Error> {
        let (hole, end) = match next {
            Next::Cached(reader) => {
                trace!(
                    key = reading.request.key,
                    position = reading.position,
                    end = reader.end(),
                    "reading from cache"
                );
                reading.source = Some(Source::Cache(reader));
                return Ok(());
            }
            Next::Hole(hole) => {
                let end = hole.end();
                (Some(hole), end)
            }
            Next::Gap { end } => (None, end),
        };

        // Bound the upstream read by the request and the gap
        let gap = end.map(|end| end - reading.position);
        let bound = match (reading.remaining, gap) {
            (Some(remaining), Some(gap)) => Some(remaining.min(gap)),
            (remaining, gap) => remaining.or(gap),
        };
        let sub = reading.request.subrange(reading.position, bound);
        let resolved = match self.upstream.open(&sub) {
            Ok(resolved) => resolved,
            Err(err) => {
                if let Some(hole) = hole {
                    self.cache.release(hole);
                }
                return Err(err.into());
            }
        };
        trace!(
            key = sub.key,
            start = sub.start,
            bound = ?bound,
            resolved = ?resolved,
            locked = hole.is_some(),
            "reading from upstream"
        );

        // Cache what is read when the length is known (or explicitly allowed)
        let length = match (bound, resolved) {
            (None, Some(resolved)) => {
                reading.remaining = Some(resolved);
                Some(resolved)
            }
            (bound, resolved) => resolved.or(bound),
        };
        let mut fetch = Fetch {
            length,
            read: 0,
            hole: None,
            writer: None,
            recheck_at: None,
        };
        match (hole, self.cfg.writer) {
            (Some(hole), Some(cfg))
                if length.is_some() || reading.request.flags.allow_cache_while_length_unknown =>
            {
                fetch.writer = Some(Writer::new(self.cache.clone(), cfg, hole));
            }
            (Some(hole), _) => fetch.hole = Some(hole),
            (None, _) => {
                if !reading.ignore_cache {
                    fetch.recheck_at = Some(reading.position + self.cfg.recheck_interval.get());
                }
            }
        }
        reading.source = Some(Source::Upstream(fetch));

        // Learn the length of the resource from an unbounded request
        if let (None, Some(resolved)) = (bound, resolved) {
            if self.cfg.writer.is_some() && !reading.ignore_cache {
                self.persist_length(reading, reading.position + resolved);
            }
        }
        Ok(())
    }

    /// The resource ends at the current position.
    fn end_of_resource(&mut self, reading: &mut Reading<S>, persist: bool) {
        let position = reading.position;
        let proven = position == 0
            || position > reading.request.start
            || matches!(&reading.source, Some(Source::Upstream(fetch)) if fetch.read > 0);
        debug!(key = reading.request.key, position, proven, "reached end of resource");
        if persist && proven && self.cfg.writer.is_some() && !reading.ignore_cache {
            self.persist_length(reading, position);
        }
        reading.remaining = Some(0);
        self.close_source(reading);
    }

    /// Persist the total length of the resource, continuing without it on failure.
    fn persist_length(&self, reading: &Reading<S>, length: u64) {
        if let Err(err) = self.cache.set_length(&reading.request.key, length) {
            warn!(key = reading.request.key, length, ?err, "failed to persist length");
        }
    }

    /// Close the active sub-source, committing what was written and releasing held regions.
    fn close_source(&mut self, reading: &mut Reading<S>) {
        let Some(source) = reading.source.take() else {
            return;
        };
        let Source::Upstream(fetch) = source else {
            return;
        };
        self.upstream.close();
        if let Some(writer) = fetch.writer {
            match writer.close() {
                Ok(spans) => trace!(key = reading.request.key, spans = spans.len(), "closed writer"),
                Err(err) => warn!(key = reading.request.key, ?err, "failed to close writer"),
            }
        }
        if let Some(hole) = fetch.hole {
            self.cache.release(hole);
        }
    }

    /// Tear down the request.
    fn finish(&mut self, reading: &mut Reading<S>) {
        self.close_source(reading);
        trace!(
            key = reading.request.key,
            position = reading.position,
            "closed request"
        );
    }
}

impl<S: Storage, U: Upstream> Drop for CachedSource<S, U> {
    fn drop(&mut self) {
        self.close();
    }
}
