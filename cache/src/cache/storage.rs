use super::{Config, Error, Metrics};
use crate::{
    evictor::Evictor,
    index::{Index, Located},
    metadata::{Metadata, Record},
    span::{Acquired, Hole, Lookup, Span},
    storage::{Blob as _, Error as StorageError, Storage},
};
use bytes::{Buf, BufMut};
use commonware_utils::hex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Condvar, Mutex, MutexGuard},
};
use tracing::{debug, trace, warn};

/// Size of a span blob name: key id, start, and sequence.
const NAME_SIZE: usize = 4 + 8 + 8;

fn encode_name(id: u32, start: u64, sequence: u64) -> Vec<u8> {
    let mut name = Vec::with_capacity(NAME_SIZE);
    name.put_u32(id);
    name.put_u64(start);
    name.put_u64(sequence);
    name
}

fn decode_name(mut name: &[u8]) -> Option<(u32, u64, u64)> {
    if name.len() != NAME_SIZE {
        return None;
    }
    Some((name.get_u32(), name.get_u64(), name.get_u64()))
}

/// Everything known about a key.
#[derive(Default)]
struct Content {
    id: Option<u32>,
    length: Option<u64>,
    index: Index,
}

impl Content {
    /// Returns true if nothing is cached, held, or known about the key.
    fn is_unused(&self) -> bool {
        self.length.is_none() && self.index.is_empty()
    }
}

struct State<S: Storage> {
    contents: HashMap<String, Content>,
    metadata: Metadata<S>,
    evictor: Box<dyn Evictor>,

    next_id: u32,
    next_hole: u64,
    clock: u64,
}

struct Inner<S: Storage> {
    storage: S,
    cfg: Config,

    state: Mutex<State<S>>,
    released: Condvar,

    metrics: Metrics,
}

/// A disk-backed cache of byte ranges keyed by resource.
///
/// [Cache] is cheap to clone; all clones share the same index.
pub struct Cache<S: Storage> {
    inner: Arc<Inner<S>>,
}

impl<S: Storage> Clone for Cache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Storage> Cache<S> {
    /// Initialize a [Cache], restoring all spans and lengths persisted in `storage`.
    ///
    /// Blobs that cannot be attributed to a known key, are empty, or overlap a previously
    /// restored span are removed.
    pub fn init(storage: S, cfg: Config, evictor: impl Evictor) -> Result<Self, Error> {
        let (metadata, records) = Metadata::init(&storage, &cfg.metadata_partition)?;

        // Restore keys
        let mut contents = HashMap::new();
        let mut keys = HashMap::new();
        let mut next_id = 0u32;
        for (key, record) in records {
            next_id = next_id.max(record.id.checked_add(1).ok_or(Error::TooManyKeys)?);
            keys.insert(record.id, key.clone());
            contents.insert(
                key,
                Content {
                    id: Some(record.id),
                    length: record.length,
                    index: Index::default(),
                },
            );
        }

        // Restore spans
        let names = match storage.scan(&cfg.partition) {
            Ok(names) => names,
            Err(StorageError::PartitionMissing(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let mut restored = Vec::new();
        let mut stale = Vec::new();
        let mut clock = 0;
        for name in names {
            let Some((id, start, sequence)) = decode_name(&name) else {
                warn!(name = hex(&name), "unexpected blob name");
                stale.push(name);
                continue;
            };
            let Some(key) = keys.get(&id) else {
                debug!(name = hex(&name), id, "blob of unknown key");
                stale.push(name);
                continue;
            };
            let (_, length) = storage.open(&cfg.partition, &name)?;
            let span = Span {
                key: key.clone(),
                start,
                length,
                name,
                last_touch: sequence,
            };
            let Some(content) = contents.get_mut(key) else {
                continue;
            };
            if !content.index.insert(span.clone()) {
                debug!(key, start, length, "discarding empty or overlapping blob");
                stale.push(span.name);
                continue;
            }
            clock = clock.max(sequence + 1);
            restored.push(span);
        }
        for name in &stale {
            if let Err(err) = storage.remove(&cfg.partition, Some(name)) {
                warn!(name = hex(name), ?err, "failed to remove stale blob");
            }
        }

        // Initialize metrics
        let metrics = {
            let mut registry = cfg.registry.lock().unwrap();
            Metrics::init(&mut registry)
        };
        metrics.keys.set(contents.len() as i64);
        metrics.spans.set(restored.len() as i64);
        metrics
            .cached_bytes
            .set(restored.iter().map(|span| span.length as i64).sum());

        let cache = Self {
            inner: Arc::new(Inner {
                storage,
                cfg,
                state: Mutex::new(State {
                    contents,
                    metadata,
                    evictor: Box::new(evictor),
                    next_id,
                    next_hole: 0,
                    clock,
                }),
                released: Condvar::new(),
                metrics,
            }),
        };

        // Replay restored spans (oldest first) through the evictor
        restored.sort_by_key(|span| span.last_touch);
        let mut removed = Vec::new();
        {
            let mut state = cache.state();
            for span in &restored {
                let victims = state.evictor.on_span_added(span);
                removed.extend(cache.evict(&mut state, victims, Some(span)));
            }
            let unused: Vec<String> = state
                .contents
                .iter()
                .filter(|(_, content)| content.is_unused())
                .map(|(key, _)| key.clone())
                .collect();
            for key in unused {
                cache.forget_if_unused(&mut state, &key);
            }
        }
        cache.delete(removed);
        debug!(spans = restored.len(), stale = stale.len(), "restored cache");
        Ok(cache)
    }

    fn state(&self) -> MutexGuard<'_, State<S>> {
        self.inner.state.lock().unwrap()
    }

    /// Metrics of this cache (shared with the sources reading through it).
    pub(crate) fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Look up `offset` of `key` without taking a lock. Holes are reported as gaps.
    pub fn query(&self, key: &str, offset: u64) -> Lookup {
        let state = self.state();
        match state.contents.get(key) {
            Some(content) => content.index.lookup(offset),
            None => Lookup::Gap { end: None },
        }
    }

    /// Serve `offset` of `key` from a data span or reserve it, returning `None` if another
    /// writer holds it.
    fn lock_or_touch(&self, state: &mut State<S>, key: &str, offset: u64) -> Option<Acquired> {
        let State {
            contents,
            evictor,
            next_hole,
            clock,
            ..
        } = state;
        if !contents.contains_key(key) {
            contents.insert(key.to_string(), Content::default());
            self.inner.metrics.keys.set(contents.len() as i64);
        }
        let content = contents.get_mut(key)?;
        match content.index.locate(offset) {
            Located::Data(span) => {
                let start = span.start;
                let stamp = *clock;
                *clock += 1;
                let old = content.index.touch(start, stamp)?;
                let new = Span {
                    last_touch: stamp,
                    ..old.clone()
                };
                evictor.on_span_touched(&old, &new);
                self.inner.metrics.hits.inc();
                trace!(key, offset, start, length = new.length, "cache hit");
                Some(Acquired::Cached(new))
            }
            Located::Held(_) => None,
            Located::Free { .. } => {
                let id = *next_hole;
                *next_hole += 1;
                let end = content.index.reserve(offset, id).ok()?;
                self.inner.metrics.misses.inc();
                trace!(key, offset, ?end, id, "reserved hole");
                Some(Acquired::Hole(Hole {
                    key: key.to_string(),
                    id,
                    start: offset,
                    end,
                }))
            }
        }
    }

    /// Acquire `offset` of `key`, waiting while another writer holds it.
    ///
    /// Returns the data span covering `offset` if there is one. Otherwise, reserves the region
    /// from `offset` up to the next known span and returns the [Hole] (the caller becomes its
    /// exclusive writer). After waking, the whole lookup is repeated.
    pub fn acquire(&self, key: &str, offset: u64) -> Acquired {
        let mut state = self.state();
        let mut waited = false;
        loop {
            if let Some(acquired) = self.lock_or_touch(&mut state, key, offset) {
                return acquired;
            }
            if !waited {
                self.inner.metrics.contended.inc();
                waited = true;
            }
            trace!(key, offset, "waiting for hole to be released");
            state = self.inner.released.wait(state).unwrap();
        }
    }

    /// Acquire `offset` of `key` without waiting.
    ///
    /// Identical to [Cache::acquire] except that `None` is returned when another writer holds
    /// the region.
    pub fn try_acquire(&self, key: &str, offset: u64) -> Option<Acquired> {
        let mut state = self.state();
        let acquired = self.lock_or_touch(&mut state, key, offset);
        if acquired.is_none() {
            self.inner.metrics.contended.inc();
            trace!(key, offset, "hole held by another writer");
        }
        acquired
    }

    /// Release a [Hole] without (further) committing data, waking any waiters.
    pub fn release(&self, hole: Hole) {
        let mut state = self.state();
        if let Some(content) = state.contents.get_mut(&hole.key) {
            if content.index.release(hole.start, hole.id) {
                trace!(key = hole.key, start = hole.start, id = hole.id, "released hole");
            }
        }
        self.forget_if_unused(&mut state, &hole.key);
        drop(state);
        self.inner.released.notify_all();
    }

    /// Create the blob that will hold data for the front of `hole`.
    ///
    /// The evictor may remove spans to make room for up to `max_length` bytes first.
    pub fn start_file(&self, hole: &Hole, max_length: u64) -> Result<(Vec<u8>, S::Blob), Error> {
        if hole.is_exhausted() {
            return Err(Error::HoleExhausted);
        }
        let mut state = self.state();
        let victims = state
            .evictor
            .on_start_file(&hole.key, hole.start, max_length);
        let removed = self.evict(&mut state, victims, None);
        let id = self.ensure_id(&mut state, &hole.key)?;
        let sequence = state.clock;
        state.clock += 1;
        drop(state);
        self.delete(removed);

        let name = encode_name(id, hole.start, sequence);
        let (blob, len) = self.inner.storage.open(&self.inner.cfg.partition, &name)?;
        if len > 0 {
            blob.resize(0)?;
        }
        trace!(key = hole.key, start = hole.start, name = hex(&name), "started blob");
        Ok((name, blob))
    }

    /// Commit the first `length` bytes of `hole`, which must have been written to the blob
    /// `name` (obtained from [Cache::start_file]), as a data span.
    ///
    /// The hole shrinks to start after the committed bytes (it is exhausted if nothing remains).
    /// Waiters are woken and the evictor may remove other spans before this returns.
    pub fn commit(&self, hole: &mut Hole, name: Vec<u8>, length: u64) -> Result<Span, Error> {
        if length == 0 {
            return Err(Error::EmptyCommit);
        }
        let end = hole.start.checked_add(length).ok_or(Error::OutOfHole)?;
        if hole.end.is_some_and(|hole_end| end > hole_end) {
            return Err(Error::OutOfHole);
        }

        // Spans are stamped with the sequence of their blob so restarts restore the same order
        let mut state = self.state();
        let stamp = match decode_name(&name) {
            Some((_, _, sequence)) => sequence,
            None => {
                let stamp = state.clock;
                state.clock += 1;
                stamp
            }
        };
        let span = Span {
            key: hole.key.clone(),
            start: hole.start,
            length,
            name,
            last_touch: stamp,
        };
        let content = state
            .contents
            .get_mut(&hole.key)
            .ok_or(Error::HoleNotHeld)?;
        if !content.index.fill(hole.id, span.clone()) {
            return Err(Error::HoleNotHeld);
        }
        hole.start = end;
        self.inner.metrics.spans.inc();
        self.inner.metrics.cached_bytes.inc_by(length as i64);
        debug!(key = span.key, start = span.start, length, "committed span");

        // Run the evictor before anyone can observe the index again
        let victims = state.evictor.on_span_added(&span);
        let removed = self.evict(&mut state, victims, Some(&span));
        drop(state);
        self.inner.released.notify_all();
        self.delete(removed);
        Ok(span)
    }

    /// Remove a blob that was started but never committed.
    pub fn discard_file(&self, name: &[u8]) -> Result<(), Error> {
        self.inner
            .storage
            .remove(&self.inner.cfg.partition, Some(name))?;
        trace!(name = hex(name), "discarded blob");
        Ok(())
    }

    /// Remove a data span and delete its blob.
    ///
    /// Returns false if the span was no longer in the cache. Readers that already opened the
    /// span's blob are unaffected.
    pub fn remove(&self, span: &Span) -> Result<bool, Error> {
        let mut state = self.state();
        let Some(removed) = self.unindex(&mut state, span) else {
            return Ok(false);
        };
        drop(state);
        debug!(key = removed.key, start = removed.start, "removed span");
        self.inner
            .storage
            .remove(&self.inner.cfg.partition, Some(&removed.name))?;
        Ok(true)
    }

    /// Remove `span` from the index, notifying the evictor.
    fn unindex(&self, state: &mut State<S>, span: &Span) -> Option<Span> {
        let State {
            contents, evictor, ..
        } = state;
        let content = contents.get_mut(&span.key)?;
        let removed = content.index.remove(span.start, &span.name)?;
        evictor.on_span_removed(&removed);
        self.inner.metrics.spans.dec();
        self.inner.metrics.cached_bytes.dec_by(removed.length as i64);
        self.forget_if_unused(state, &span.key);
        Some(removed)
    }

    /// Drop `key` (and its persisted record) once nothing is cached, held, or known about it.
    fn forget_if_unused(&self, state: &mut State<S>, key: &str) {
        let Some(content) = state.contents.get(key) else {
            return;
        };
        if !content.is_unused() {
            return;
        }
        let id = content.id;
        state.contents.remove(key);
        self.inner.metrics.keys.set(state.contents.len() as i64);
        if let Some(id) = id {
            match Self::persist(state) {
                Ok(()) => debug!(key, id, "forgot key"),
                Err(err) => warn!(key, id, ?err, "failed to forget key"),
            }
        }
    }

    /// Remove `victims` (except `keep`) from the index, returning the names of blobs to delete.
    fn evict(&self, state: &mut State<S>, victims: Vec<Span>, keep: Option<&Span>) -> Vec<Vec<u8>> {
        let mut names = Vec::new();
        for victim in victims {
            if keep.is_some_and(|keep| keep.key == victim.key && keep.start == victim.start) {
                warn!(key = victim.key, start = victim.start, "evictor selected new span");
                continue;
            }
            if let Some(removed) = self.unindex(state, &victim) {
                debug!(key = removed.key, start = removed.start, "evicted span");
                self.inner.metrics.evicted.inc();
                names.push(removed.name);
            }
        }
        names
    }

    /// Delete blobs that are no longer indexed.
    fn delete(&self, names: Vec<Vec<u8>>) {
        for name in names {
            if let Err(err) = self
                .inner
                .storage
                .remove(&self.inner.cfg.partition, Some(&name))
            {
                warn!(name = hex(&name), ?err, "failed to remove blob");
            }
        }
    }

    /// Return the id of `key`, assigning (and persisting) one if needed.
    fn ensure_id(&self, state: &mut State<S>, key: &str) -> Result<u32, Error> {
        if let Some(id) = state.contents.get(key).and_then(|content| content.id) {
            return Ok(id);
        }
        let id = state.next_id;
        state.next_id = id.checked_add(1).ok_or(Error::TooManyKeys)?;
        state.contents.entry(key.to_string()).or_default().id = Some(id);
        self.inner.metrics.keys.set(state.contents.len() as i64);
        if let Err(err) = Self::persist(state) {
            if let Some(content) = state.contents.get_mut(key) {
                content.id = None;
            }
            state.next_id = id;
            return Err(err);
        }
        debug!(key, id, "assigned key id");
        Ok(id)
    }

    /// Durably store the records of all keys that have an id.
    fn persist(state: &mut State<S>) -> Result<(), Error> {
        let records: BTreeMap<String, Record> = state
            .contents
            .iter()
            .filter_map(|(key, content)| {
                content.id.map(|id| {
                    (
                        key.clone(),
                        Record {
                            id,
                            length: content.length,
                        },
                    )
                })
            })
            .collect();
        state.metadata.sync(&records)?;
        Ok(())
    }

    /// Open the blob of `span` if the span is still in the cache.
    ///
    /// The blob is opened while the span is known to be indexed, so a concurrent removal cannot
    /// delete it first. Returns the blob and its current length.
    pub fn open_span(&self, span: &Span) -> Result<Option<(S::Blob, u64)>, Error> {
        let state = self.state();
        let indexed = state
            .contents
            .get(&span.key)
            .is_some_and(|content| match content.index.locate(span.start) {
                Located::Data(indexed) => indexed.name == span.name,
                _ => false,
            });
        if !indexed {
            return Ok(None);
        }
        let opened = self
            .inner
            .storage
            .open(&self.inner.cfg.partition, &span.name)?;
        drop(state);
        Ok(Some(opened))
    }

    /// Persist the total length of `key`.
    pub fn set_length(&self, key: &str, length: u64) -> Result<(), Error> {
        let mut state = self.state();
        if state
            .contents
            .get(key)
            .is_some_and(|content| content.length == Some(length))
        {
            return Ok(());
        }
        let content = state.contents.entry(key.to_string()).or_default();
        let previous = content.length.replace(length);
        let result = if content.id.is_some() {
            Self::persist(&mut state)
        } else {
            self.ensure_id(&mut state, key).map(|_| ())
        };
        if let Err(err) = result {
            if let Some(content) = state.contents.get_mut(key) {
                content.length = previous;
            }
            self.forget_if_unused(&mut state, key);
            return Err(err);
        }
        debug!(key, length, "set content length");
        Ok(())
    }

    /// Returns the persisted total length of `key` (if known).
    pub fn length(&self, key: &str) -> Option<u64> {
        self.state()
            .contents
            .get(key)
            .and_then(|content| content.length)
    }

    /// Returns all keys with at least one data span.
    pub fn keys(&self) -> Vec<String> {
        let state = self.state();
        let mut keys: Vec<String> = state
            .contents
            .iter()
            .filter(|(_, content)| content.index.len() > 0)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Returns all data spans of `key`, ordered by start.
    pub fn spans(&self, key: &str) -> Vec<Span> {
        self.state()
            .contents
            .get(key)
            .map(|content| content.index.spans().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of contiguous cached bytes of `key` starting at `position`, considering
    /// at most `length` bytes (if provided).
    pub fn cached_bytes(&self, key: &str, position: u64, length: Option<u64>) -> u64 {
        self.state()
            .contents
            .get(key)
            .map_or(0, |content| content.index.cached_bytes(position, length))
    }

    /// Returns true if all of `[position, position + length)` of `key` is cached.
    pub fn is_cached(&self, key: &str, position: u64, length: u64) -> bool {
        self.cached_bytes(key, position, Some(length)) == length
    }

    /// Returns the total number of bytes held by data spans.
    pub fn cache_space(&self) -> u64 {
        self.state()
            .contents
            .values()
            .map(|content| content.index.bytes())
            .sum()
    }

    /// Remove all persistent data created by this [Cache].
    pub fn destroy(self) -> Result<(), Error> {
        for partition in [&self.inner.cfg.partition, &self.inner.cfg.metadata_partition] {
            match self.inner.storage.remove(partition, None) {
                Ok(()) | Err(StorageError::PartitionMissing(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Returns true if no two entries of any key overlap.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        self.state()
            .contents
            .values()
            .all(|content| content.index.is_consistent())
    }
}
