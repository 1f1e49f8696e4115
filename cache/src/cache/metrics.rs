//! Metrics for [super::Cache].

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for [super::Cache].
#[derive(Default)]
pub struct Metrics {
    /// Keys tracked by the cache.
    pub keys: Gauge,
    /// Data spans in the cache.
    pub spans: Gauge,
    /// Bytes held by data spans.
    pub cached_bytes: Gauge,
    /// Acquisitions served by a data span.
    pub hits: Counter,
    /// Acquisitions that reserved a hole.
    pub misses: Counter,
    /// Acquisitions that found the region held by another writer.
    pub contended: Counter,
    /// Spans removed by the evictor.
    pub evicted: Counter,
    /// Bytes served to readers from the cache.
    pub cache_reads: Counter,
    /// Bytes served to readers from upstream.
    pub upstream_reads: Counter,
}

impl Metrics {
    /// Create and register metrics with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register("keys", "Keys tracked", metrics.keys.clone());
        registry.register("spans", "Data spans held", metrics.spans.clone());
        registry.register(
            "cached_bytes",
            "Bytes held by data spans",
            metrics.cached_bytes.clone(),
        );
        registry.register("hits", "Acquisitions served by a span", metrics.hits.clone());
        registry.register("misses", "Acquisitions that reserved a hole", metrics.misses.clone());
        registry.register(
            "contended",
            "Acquisitions that found the region held",
            metrics.contended.clone(),
        );
        registry.register("evicted", "Spans removed by the evictor", metrics.evicted.clone());
        registry.register(
            "cache_reads",
            "Bytes served from the cache",
            metrics.cache_reads.clone(),
        );
        registry.register(
            "upstream_reads",
            "Bytes served from upstream",
            metrics.upstream_reads.clone(),
        );
        metrics
    }
}
