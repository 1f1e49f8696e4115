use super::Evictor;
use crate::span::Span;
use std::collections::BTreeMap;
use tracing::debug;

/// Order of a span in the recency queue.
type Order = (u64, String, u64);

fn order(span: &Span) -> Order {
    (span.last_touch, span.key.clone(), span.start)
}

/// Evicts the least recently touched spans once the total size of all spans exceeds `max_bytes`.
pub struct LeastRecentlyUsed {
    max_bytes: u64,

    spans: BTreeMap<Order, Span>,
    bytes: u64,
}

impl LeastRecentlyUsed {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            spans: BTreeMap::new(),
            bytes: 0,
        }
    }

    /// Total size of all tracked spans.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Select the oldest spans (skipping `keep`) until `reserve` more bytes fit in the budget.
    fn select(&self, reserve: u64, keep: Option<&Order>) -> Vec<Span> {
        let mut victims = Vec::new();
        let mut bytes = self.bytes;
        for (order, span) in &self.spans {
            if bytes.saturating_add(reserve) <= self.max_bytes {
                break;
            }
            if Some(order) == keep {
                continue;
            }
            bytes -= span.length;
            victims.push(span.clone());
        }
        if !victims.is_empty() {
            debug!(
                victims = victims.len(),
                bytes = self.bytes,
                max = self.max_bytes,
                "selected spans for eviction"
            );
        }
        victims
    }
}

impl Evictor for LeastRecentlyUsed {
    fn on_start_file(&mut self, _: &str, _: u64, max_length: u64) -> Vec<Span> {
        self.select(max_length, None)
    }

    fn on_span_added(&mut self, span: &Span) -> Vec<Span> {
        let order = order(span);
        self.bytes += span.length;
        self.spans.insert(order.clone(), span.clone());
        self.select(0, Some(&order))
    }

    fn on_span_removed(&mut self, span: &Span) {
        if self.spans.remove(&order(span)).is_some() {
            self.bytes -= span.length;
        }
    }

    fn on_span_touched(&mut self, old: &Span, new: &Span) {
        if self.spans.remove(&order(old)).is_some() {
            self.spans.insert(order(new), new.clone());
        }
    }
}
