//! Ordered, non-overlapping spans of a single key.
//!
//! Every byte of a key is in one of three states: covered by a data span, covered by a hole (a
//! reservation held by a writer), or free. The [Index] stores data spans and holes in a map keyed
//! by start offset and rejects any mutation that would make two entries claim the same byte.

use crate::span::{Lookup, Span};
use std::{
    collections::BTreeMap,
    ops::Bound::{Excluded, Unbounded},
};

/// An entry of the [Index].
#[derive(Debug)]
enum Slot {
    Data(Span),
    Hole { id: u64, end: Option<u64> },
}

impl Slot {
    fn end(&self, start: u64) -> Option<u64> {
        match self {
            Slot::Data(span) => Some(start + span.length),
            Slot::Hole { end, .. } => *end,
        }
    }
}

/// State of an offset.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Located<'a> {
    /// Covered by a data span.
    Data(&'a Span),
    /// Covered by the hole with the given id.
    Held(u64),
    /// Not covered; the next entry (if any) starts at `end`.
    Free { end: Option<u64> },
}

/// Spans of a single key.
#[derive(Debug, Default)]
pub(crate) struct Index {
    slots: BTreeMap<u64, Slot>,

    // Total length of all data spans
    bytes: u64,
}

impl Index {
    /// Returns the entry covering `offset` (if any).
    fn covering(&self, offset: u64) -> Option<(u64, &Slot)> {
        let (&start, slot) = self.slots.range(..=offset).next_back()?;
        match slot.end(start) {
            Some(end) if offset >= end => None,
            _ => Some((start, slot)),
        }
    }

    /// Returns the start of the first entry beginning after `offset`.
    fn next_start(&self, offset: u64) -> Option<u64> {
        self.slots
            .range((Excluded(offset), Unbounded))
            .next()
            .map(|(start, _)| *start)
    }

    /// Returns the start of the first data span beginning after `offset`.
    fn next_data_start(&self, offset: u64) -> Option<u64> {
        self.slots
            .range((Excluded(offset), Unbounded))
            .find(|(_, slot)| matches!(slot, Slot::Data(_)))
            .map(|(start, _)| *start)
    }

    /// Determine the state of `offset`.
    pub fn locate(&self, offset: u64) -> Located<'_> {
        match self.covering(offset) {
            Some((_, Slot::Data(span))) => Located::Data(span),
            Some((_, Slot::Hole { id, .. })) => Located::Held(*id),
            None => Located::Free {
                end: self.next_start(offset),
            },
        }
    }

    /// Look up `offset`, treating holes as gaps.
    pub fn lookup(&self, offset: u64) -> Lookup {
        match self.covering(offset) {
            Some((_, Slot::Data(span))) => Lookup::Cached(span.clone()),
            _ => Lookup::Gap {
                end: self.next_data_start(offset),
            },
        }
    }

    /// Reserve the free region starting at `offset` for the hole `id`.
    ///
    /// The reservation extends up to the next known entry. Returns the end of the reservation, or
    /// `Err(())` if `offset` is not free.
    #[allow(clippy::result_unit_err)]
    pub fn reserve(&mut self, offset: u64, id: u64) -> Result<Option<u64>, ()> {
        let end = match self.locate(offset) {
            Located::Free { end } => end,
            _ => return Err(()),
        };
        self.slots.insert(offset, Slot::Hole { id, end });
        Ok(end)
    }

    /// Remove the hole `id` starting at `start`. Returns false if no such hole exists.
    pub fn release(&mut self, start: u64, id: u64) -> bool {
        match self.slots.get(&start) {
            Some(Slot::Hole { id: held, .. }) if *held == id => {
                self.slots.remove(&start);
                true
            }
            _ => false,
        }
    }

    /// Replace the front of the hole `id` (starting at `span.start`) with `span`.
    ///
    /// Any remainder of the hole stays reserved for the same holder, starting at `span.end()`.
    /// Returns false (leaving the index untouched) if the hole does not exist or is too short.
    pub fn fill(&mut self, id: u64, span: Span) -> bool {
        let end = match self.slots.get(&span.start) {
            Some(Slot::Hole { id: held, end }) if *held == id => *end,
            _ => return false,
        };
        let span_end = span.end();
        if span.length == 0 || end.is_some_and(|end| span_end > end) {
            return false;
        }
        self.slots.remove(&span.start);
        if end != Some(span_end) {
            self.slots.insert(span_end, Slot::Hole { id, end });
        }
        self.bytes += span.length;
        self.slots.insert(span.start, Slot::Data(span));
        true
    }

    /// Insert a data span that no hole reserved (used when restoring spans from storage).
    ///
    /// Returns false if the span would overlap an existing entry.
    pub fn insert(&mut self, span: Span) -> bool {
        if span.length == 0 || self.covering(span.start).is_some() {
            return false;
        }
        if self
            .next_start(span.start)
            .is_some_and(|next| next < span.end())
        {
            return false;
        }
        self.bytes += span.length;
        self.slots.insert(span.start, Slot::Data(span));
        true
    }

    /// Remove the data span starting at `start` if it is backed by the blob `name`.
    pub fn remove(&mut self, start: u64, name: &[u8]) -> Option<Span> {
        match self.slots.get(&start) {
            Some(Slot::Data(span)) if span.name == name => {}
            _ => return None,
        }
        let Some(Slot::Data(span)) = self.slots.remove(&start) else {
            unreachable!("slot checked above");
        };
        self.bytes -= span.length;
        Some(span)
    }

    /// Mark the data span starting at `start` as used at `stamp`, returning the previous version.
    pub fn touch(&mut self, start: u64, stamp: u64) -> Option<Span> {
        match self.slots.get_mut(&start) {
            Some(Slot::Data(span)) => {
                let previous = span.clone();
                span.last_touch = stamp;
                Some(previous)
            }
            _ => None,
        }
    }

    /// Returns the number of contiguous cached bytes starting at `position`, considering at most
    /// `length` bytes (if provided).
    pub fn cached_bytes(&self, position: u64, length: Option<u64>) -> u64 {
        let limit = length.and_then(|length| position.checked_add(length));
        let mut cursor = position;
        while limit.map_or(true, |limit| cursor < limit) {
            match self.covering(cursor) {
                Some((_, Slot::Data(span))) => cursor = span.end(),
                _ => break,
            }
        }
        match limit {
            Some(limit) => cursor.min(limit) - position,
            None => cursor - position,
        }
    }

    /// Iterate over all data spans in order.
    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.slots.values().filter_map(|slot| match slot {
            Slot::Data(span) => Some(span),
            Slot::Hole { .. } => None,
        })
    }

    /// Returns the number of data spans.
    pub fn len(&self) -> usize {
        self.spans().count()
    }

    /// Returns the total length of all data spans.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Returns true if the index holds neither data spans nor holes.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns true if no two entries overlap.
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        let mut previous_end = Some(0);
        for (start, slot) in &self.slots {
            match previous_end {
                Some(end) if end <= *start => {}
                _ => return false,
            }
            previous_end = slot.end(*start);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn span(start: u64, length: u64) -> Span {
        Span {
            key: "key".into(),
            start,
            length,
            name: start.to_be_bytes().to_vec(),
            last_touch: 0,
        }
    }

    #[test]
    fn test_reserve_caps_at_next_entry() {
        let mut index = Index::default();
        assert!(index.insert(span(10, 5)));

        assert_eq!(index.reserve(0, 1), Ok(Some(10)));
        assert_eq!(index.reserve(15, 2), Ok(None));
        assert_eq!(index.locate(3), Located::Held(1));
        assert_eq!(index.locate(100), Located::Held(2));
        assert!(matches!(index.locate(12), Located::Data(_)));

        // Covered offsets cannot be reserved again
        assert_eq!(index.reserve(5, 3), Err(()));
        assert_eq!(index.reserve(12, 3), Err(()));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_release_requires_matching_id() {
        let mut index = Index::default();
        index.reserve(0, 7).unwrap();
        assert!(!index.release(0, 8));
        assert!(!index.release(1, 7));
        assert!(index.release(0, 7));
        assert!(index.is_empty());
        assert_eq!(index.locate(0), Located::Free { end: None });
    }

    #[test]
    fn test_fill_splits_hole() {
        let mut index = Index::default();
        index.reserve(0, 1).unwrap();
        assert!(index.fill(1, span(0, 3)));
        assert!(index.fill(1, span(3, 3)));
        assert_eq!(index.locate(6), Located::Held(1));
        assert_eq!(index.bytes(), 6);
        assert_eq!(index.len(), 2);

        // Wrong start, wrong id, or empty spans are rejected
        assert!(!index.fill(1, span(7, 3)));
        assert!(!index.fill(2, span(6, 3)));
        assert!(!index.fill(1, span(6, 0)));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_fill_exact_consumes_hole() {
        let mut index = Index::default();
        assert!(index.insert(span(4, 2)));
        assert_eq!(index.reserve(0, 1), Ok(Some(4)));

        // Overflowing the hole is rejected
        assert!(!index.fill(1, span(0, 5)));
        assert!(index.fill(1, span(0, 4)));
        assert!(!index.release(4, 1));
        assert_eq!(index.spans().count(), 2);
        assert_eq!(index.cached_bytes(0, None), 6);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_insert_rejects_overlap() {
        let mut index = Index::default();
        assert!(index.insert(span(10, 10)));
        assert!(!index.insert(span(5, 6)));
        assert!(!index.insert(span(15, 1)));
        assert!(!index.insert(span(19, 5)));
        assert!(index.insert(span(5, 5)));
        assert!(index.insert(span(20, 5)));
        assert!(!index.insert(span(30, 0)));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_lookup_treats_holes_as_gaps() {
        let mut index = Index::default();
        assert!(index.insert(span(20, 5)));
        assert_eq!(index.reserve(0, 1), Ok(Some(20)));
        assert_eq!(index.lookup(3), Lookup::Gap { end: Some(20) });
        assert_eq!(index.lookup(20), Lookup::Cached(span(20, 5)));
        assert_eq!(index.lookup(25), Lookup::Gap { end: None });
    }

    #[test]
    fn test_remove_checks_name() {
        let mut index = Index::default();
        assert!(index.insert(span(0, 4)));
        assert!(index.remove(0, b"other").is_none());
        assert!(index.remove(1, &0u64.to_be_bytes()).is_none());
        assert_eq!(index.remove(0, &0u64.to_be_bytes()), Some(span(0, 4)));
        assert_eq!(index.bytes(), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn test_touch() {
        let mut index = Index::default();
        assert!(index.insert(span(0, 4)));
        let previous = index.touch(0, 9).unwrap();
        assert_eq!(previous.last_touch, 0);
        match index.locate(2) {
            Located::Data(span) => assert_eq!(span.last_touch, 9),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(index.touch(2, 10).is_none());
    }

    #[test_case(0, None, 6; "unbounded from start")]
    #[test_case(0, Some(4), 4; "bounded inside")]
    #[test_case(2, Some(100), 4; "bounded past end")]
    #[test_case(6, None, 0; "at gap")]
    #[test_case(8, None, 2; "second run")]
    #[test_case(7, Some(0), 0; "empty request")]
    fn test_cached_bytes(position: u64, length: Option<u64>, expected: u64) {
        let mut index = Index::default();
        assert!(index.insert(span(0, 3)));
        assert!(index.insert(span(3, 3)));
        assert!(index.insert(span(8, 2)));
        assert_eq!(index.cached_bytes(position, length), expected);
    }
}
