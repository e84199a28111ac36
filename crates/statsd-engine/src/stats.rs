// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The engine's own metrics, reported under the `statsd.` prefix.
//!
//! Counters in the stage stats structs are drained on every report, so each
//! report carries the activity since the previous one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ustr::ustr;

use crate::buffer_pool::BufferPool;
use crate::cloud::cache::CacheReader;
use crate::constants::INTERNAL_METRIC_PREFIX;
use crate::metric::{Metric, MetricType, Tags};
use crate::receiver::ReceiverStats;
use crate::statsd::ParserStats;

/// Anything that can report internal metrics.
pub trait StatsSource: Send + Sync {
    fn report(&self, sink: &mut StatsSink);
}

/// Collects internal metrics with the internal tag set.
#[derive(Debug)]
pub struct StatsSink {
    tags: Tags,
    metrics: Vec<Metric>,
}

impl StatsSink {
    #[must_use]
    pub fn new(tags: Tags) -> Self {
        Self {
            tags,
            metrics: Vec::new(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn counter(&mut self, name: &str, value: u64) {
        self.push(name, MetricType::Counter, value as f64);
    }

    pub fn gauge(&mut self, name: &str, value: f64) {
        self.push(name, MetricType::Gauge, value);
    }

    fn push(&mut self, name: &str, metric_type: MetricType, value: f64) {
        let name = ustr(&format!("{INTERNAL_METRIC_PREFIX}.{name}"));
        self.metrics
            .push(Metric::new(name, metric_type, value, self.tags.clone()));
    }

    #[must_use]
    pub fn into_metrics(self) -> Vec<Metric> {
        self.metrics
    }
}

fn drain(counter: &AtomicU64) -> u64 {
    counter.swap(0, Ordering::Relaxed)
}

impl StatsSource for ReceiverStats {
    #[allow(clippy::cast_precision_loss)]
    fn report(&self, sink: &mut StatsSink) {
        let datagrams = drain(&self.datagrams);
        let batches = drain(&self.batches);
        sink.counter("receiver.datagrams", datagrams);
        sink.counter("receiver.batches", batches);
        sink.counter("receiver.read_errors", drain(&self.read_errors));
        sink.counter("receiver.oversized", drain(&self.oversized));
        if batches > 0 {
            sink.gauge("receiver.avg_batch_size", datagrams as f64 / batches as f64);
        }
    }
}

impl StatsSource for ParserStats {
    fn report(&self, sink: &mut StatsSink) {
        sink.counter("parser.lines", drain(&self.lines));
        sink.counter("parser.metrics", drain(&self.metrics));
        sink.counter("parser.events", drain(&self.events));
        sink.counter("parser.bad_lines", drain(&self.bad_lines));
    }
}

impl StatsSource for CacheReader {
    #[allow(clippy::cast_precision_loss)]
    fn report(&self, sink: &mut StatsSink) {
        let stats = self.stats();
        sink.counter("cloud.cache.hits", drain(&stats.hits));
        sink.counter("cloud.cache.misses", drain(&stats.misses));
        sink.counter("cloud.cache.evictions", drain(&stats.evictions));
        sink.counter("cloud.lookups", drain(&stats.lookups));
        sink.counter("cloud.lookup_errors", drain(&stats.lookup_errors));
        sink.gauge("cloud.cache.size", self.len() as f64);
    }
}

impl StatsSource for BufferPool {
    #[allow(clippy::cast_precision_loss)]
    fn report(&self, sink: &mut StatsSink) {
        let metrics = self.metrics();
        sink.counter("buffer_pool.misses", drain(&metrics.misses));
        sink.gauge("buffer_pool.available", self.available() as f64);
    }
}

/// Reports every source into one batch.
#[must_use]
pub fn collect(sources: &[Arc<dyn StatsSource>], tags: &Tags) -> Vec<Metric> {
    let mut sink = StatsSink::new(tags.clone());
    for source in sources {
        source.report(&mut sink);
    }
    sink.into_metrics()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn find<'a>(metrics: &'a [Metric], name: &str) -> &'a Metric {
        metrics.iter().find(|m| m.name.as_str() == name).unwrap()
    }

    #[test]
    fn test_receiver_stats_report_deltas_and_batch_efficiency() {
        let stats = Arc::new(ReceiverStats::default());
        stats.datagrams.store(30, Ordering::Relaxed);
        stats.batches.store(4, Ordering::Relaxed);
        stats.oversized.store(2, Ordering::Relaxed);

        let sources: Vec<Arc<dyn StatsSource>> = vec![stats.clone()];
        let metrics = collect(&sources, &Tags::parse("host:a"));
        let datagrams = find(&metrics, "statsd.receiver.datagrams");
        assert_eq!(datagrams.metric_type, MetricType::Counter);
        assert_eq!(datagrams.value, 30.0);
        assert_eq!(datagrams.tags.iter().collect::<Vec<_>>(), vec!["host:a"]);
        assert_eq!(find(&metrics, "statsd.receiver.avg_batch_size").value, 7.5);
        assert_eq!(find(&metrics, "statsd.receiver.oversized").value, 2.0);

        // drained by the first report
        let metrics = collect(&sources, &Tags::new());
        assert_eq!(find(&metrics, "statsd.receiver.datagrams").value, 0.0);
        assert!(metrics
            .iter()
            .all(|m| m.name.as_str() != "statsd.receiver.avg_batch_size"));
    }

    #[test]
    fn test_parser_stats() {
        let stats = ParserStats::default();
        stats.bad_lines.store(3, Ordering::Relaxed);
        let mut sink = StatsSink::new(Tags::new());
        stats.report(&mut sink);
        let metrics = sink.into_metrics();
        assert_eq!(find(&metrics, "statsd.parser.bad_lines").value, 3.0);
        assert!(metrics.iter().all(|m| m.hostname.is_empty()));
    }
}
