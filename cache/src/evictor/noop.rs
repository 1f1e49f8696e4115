use super::Evictor;
use crate::span::Span;

/// Never evicts anything.
///
/// Suitable when the capacity of the cache is bounded externally.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOp;

impl Evictor for NoOp {
    fn on_span_added(&mut self, _: &Span) -> Vec<Span> {
        Vec::new()
    }

    fn on_span_removed(&mut self, _: &Span) {}

    fn on_span_touched(&mut self, _: &Span, _: &Span) {}
}
