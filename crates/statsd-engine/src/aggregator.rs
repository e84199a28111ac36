// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-owner aggregation state for one worker.
//!
//! An [`Aggregator`] is never shared: the worker task owning it applies
//! every `receive`, and once per flush interval runs `flush`, `process` and
//! `reset` in that order. The order is enforced by the types:
//! [`Aggregator::flush`] borrows the aggregator mutably and returns a
//! [`FlushedWindow`], the only way to reach `process` and `reset`.

use std::time::Duration;

use fnv::FnvBuildHasher;
use hashbrown::{HashMap, HashSet};
use serde::Serialize;
use tokio::time::Instant;
use tracing::trace;
use ustr::Ustr;

use crate::metric::{Metric, MetricType, Tags};

pub type FastMap<K, V> = HashMap<K, V, FnvBuildHasher>;
pub type FastSet<T> = HashSet<T, FnvBuildHasher>;

/// Accumulators of one type, by metric name and then tags-key.
pub type NamedMap<V> = FastMap<Ustr, FastMap<String, V>>;

#[derive(Clone, Debug, Serialize)]
pub struct Counter {
    pub value: f64,
    pub per_second: f64,
    pub hostname: String,
    pub tags: Tags,
    #[serde(skip)]
    pub timestamp: Instant,
}

#[derive(Clone, Debug, Serialize)]
pub struct Gauge {
    pub value: f64,
    pub hostname: String,
    pub tags: Tags,
    #[serde(skip)]
    pub timestamp: Instant,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Percentile {
    /// `count_90`, `upper_99_9`, `lower_-10`...
    pub name: String,
    pub value: f64,
}

/// Timer samples and, after a flush, the statistics derived from them.
#[derive(Clone, Debug, Serialize)]
pub struct Timer {
    pub values: Vec<f64>,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub sum: f64,
    pub sum_squares: f64,
    pub per_second: f64,
    pub percentiles: Vec<Percentile>,
    pub hostname: String,
    pub tags: Tags,
    #[serde(skip)]
    pub timestamp: Instant,
}

#[derive(Clone, Debug, Serialize)]
pub struct Set {
    pub values: FastSet<String>,
    pub hostname: String,
    pub tags: Tags,
    #[serde(skip)]
    pub timestamp: Instant,
}

/// Everything one worker has aggregated in the current window.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AggregatedMetrics {
    pub counters: NamedMap<Counter>,
    pub gauges: NamedMap<Gauge>,
    pub timers: NamedMap<Timer>,
    pub sets: NamedMap<Set>,
}

impl AggregatedMetrics {
    /// Number of accumulators across all types.
    #[must_use]
    pub fn len(&self) -> usize {
        fn count<V>(map: &NamedMap<V>) -> usize {
            map.values().map(FastMap::len).sum()
        }
        count(&self.counters) + count(&self.gauges) + count(&self.timers) + count(&self.sets)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Folds another worker's snapshot into this one. Workers own disjoint
    /// metric names, so nothing is overwritten.
    pub fn merge(&mut self, other: &AggregatedMetrics) {
        fn extend<V: Clone>(into: &mut NamedMap<V>, from: &NamedMap<V>) {
            into.extend(from.iter().map(|(name, tagged)| (*name, tagged.clone())));
        }
        extend(&mut self.counters, &other.counters);
        extend(&mut self.gauges, &other.gauges);
        extend(&mut self.timers, &other.timers);
        extend(&mut self.sets, &other.sets);
    }
}

/// Percentile statistics that can be left out of the output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisabledSubtypes {
    pub count: bool,
    pub mean: bool,
    pub sum: bool,
    pub sum_squares: bool,
    pub upper: bool,
    pub lower: bool,
}

impl DisabledSubtypes {
    /// Marks `name` as disabled. Returns false for an unknown subtype.
    pub fn disable(&mut self, name: &str) -> bool {
        let flag = match name {
            "count" => &mut self.count,
            "mean" => &mut self.mean,
            "sum" => &mut self.sum,
            "sum_squares" => &mut self.sum_squares,
            "upper" => &mut self.upper,
            "lower" => &mut self.lower,
            _ => return false,
        };
        *flag = true;
        true
    }
}

/// A percentile threshold and the suffix used in its statistic names.
#[derive(Clone, Debug, PartialEq)]
pub struct PercentThreshold {
    pub percent: f64,
    suffix: String,
}

impl PercentThreshold {
    #[must_use]
    pub fn new(percent: f64) -> Self {
        Self {
            percent,
            suffix: percent.to_string().replace('.', "_"),
        }
    }

    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    pub percent_thresholds: Vec<PercentThreshold>,
    pub disabled_subtypes: DisabledSubtypes,
    /// Accumulators idle for longer than this are dropped; zero keeps them
    /// forever.
    pub expiry_interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            percent_thresholds: crate::constants::DEFAULT_PERCENT_THRESHOLDS
                .iter()
                .copied()
                .map(PercentThreshold::new)
                .collect(),
            disabled_subtypes: DisabledSubtypes::default(),
            expiry_interval: crate::constants::DEFAULT_EXPIRY_INTERVAL,
        }
    }
}

#[derive(Debug)]
pub struct Aggregator {
    config: AggregatorConfig,
    metrics: AggregatedMetrics,
}

impl Aggregator {
    #[must_use]
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            metrics: AggregatedMetrics::default(),
        }
    }

    /// Applies one update: counters add, gauges overwrite, timers append a
    /// sample and sets insert a member.
    pub fn receive(&mut self, mut metric: Metric, now: Instant) {
        let key = metric.tags_key().to_string();
        let Metric {
            name,
            value,
            string_value,
            metric_type,
            tags,
            hostname,
            ..
        } = metric;

        match metric_type {
            MetricType::Counter => {
                let counter = self
                    .metrics
                    .counters
                    .entry(name)
                    .or_default()
                    .entry(key)
                    .or_insert_with(|| Counter {
                        value: 0.0,
                        per_second: 0.0,
                        hostname,
                        tags,
                        timestamp: now,
                    });
                counter.value += value;
                counter.timestamp = now;
            }
            MetricType::Gauge => {
                let gauge = self
                    .metrics
                    .gauges
                    .entry(name)
                    .or_default()
                    .entry(key)
                    .or_insert_with(|| Gauge {
                        value,
                        hostname,
                        tags,
                        timestamp: now,
                    });
                gauge.value = value;
                gauge.timestamp = now;
            }
            MetricType::Timer => {
                let timer = self
                    .metrics
                    .timers
                    .entry(name)
                    .or_default()
                    .entry(key)
                    .or_insert_with(|| Timer::new(hostname, tags, now));
                timer.values.push(value);
                timer.timestamp = now;
            }
            MetricType::Set => {
                let set = self
                    .metrics
                    .sets
                    .entry(name)
                    .or_default()
                    .entry(key)
                    .or_insert_with(|| Set {
                        values: FastSet::default(),
                        hostname,
                        tags,
                        timestamp: now,
                    });
                set.values.insert(string_value);
                set.timestamp = now;
            }
        }
    }

    /// Computes per-second rates and timer statistics for a window of
    /// `interval`.
    pub fn flush(&mut self, interval: Duration) -> FlushedWindow<'_> {
        let secs = interval.as_secs_f64();
        let per_second = |value: f64| if secs > 0.0 { value / secs } else { 0.0 };

        for counter in self.metrics.counters.values_mut().flat_map(FastMap::values_mut) {
            counter.per_second = per_second(counter.value);
        }

        let config = &self.config;
        for timer in self.metrics.timers.values_mut().flat_map(FastMap::values_mut) {
            if timer.values.is_empty() {
                continue;
            }
            timer.finalize(config);
            #[allow(clippy::cast_precision_loss)]
            let count = timer.count as f64;
            timer.per_second = per_second(count);
        }

        FlushedWindow { aggregator: self }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// An aggregator whose window has been flushed.
pub struct FlushedWindow<'a> {
    aggregator: &'a mut Aggregator,
}

impl FlushedWindow<'_> {
    /// Exposes the finalized window.
    pub fn process<R>(&self, f: impl FnOnce(&AggregatedMetrics) -> R) -> R {
        f(&self.aggregator.metrics)
    }

    /// Drops accumulators idle past the expiry interval and clears counter,
    /// timer and set data for the next window. Gauges keep their value.
    pub fn reset(self, now: Instant) {
        let expiry = self.aggregator.config.expiry_interval;
        let metrics = &mut self.aggregator.metrics;
        let expired = |timestamp: Instant| {
            !expiry.is_zero() && now.saturating_duration_since(timestamp) > expiry
        };

        let mut removed = 0;
        removed += reset_map(&mut metrics.counters, |c| expired(c.timestamp), |c| {
            c.value = 0.0;
            c.per_second = 0.0;
        });
        removed += reset_map(&mut metrics.gauges, |g| expired(g.timestamp), |_| {});
        removed += reset_map(&mut metrics.timers, |t| expired(t.timestamp), Timer::clear);
        removed += reset_map(&mut metrics.sets, |s| expired(s.timestamp), |s| s.values.clear());
        if removed > 0 {
            trace!(removed, "expired idle accumulators");
        }
    }
}

/// Removes expired accumulators (and names left without any), clears the
/// rest. Returns how many accumulators were removed.
fn reset_map<V>(
    map: &mut NamedMap<V>,
    is_expired: impl Fn(&V) -> bool,
    clear: impl Fn(&mut V),
) -> usize {
    let mut removed = 0;
    map.retain(|_, tagged| {
        tagged.retain(|_, accumulator| {
            if is_expired(accumulator) {
                removed += 1;
                return false;
            }
            clear(accumulator);
            true
        });
        !tagged.is_empty()
    });
    removed
}

impl Timer {
    fn new(hostname: String, tags: Tags, now: Instant) -> Self {
        Self {
            values: Vec::new(),
            count: 0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            median: 0.0,
            std_dev: 0.0,
            sum: 0.0,
            sum_squares: 0.0,
            per_second: 0.0,
            percentiles: Vec::new(),
            hostname,
            tags,
            timestamp: now,
        }
    }

    fn clear(&mut self) {
        self.values.clear();
        self.count = 0;
        self.min = 0.0;
        self.max = 0.0;
        self.mean = 0.0;
        self.median = 0.0;
        self.std_dev = 0.0;
        self.sum = 0.0;
        self.sum_squares = 0.0;
        self.per_second = 0.0;
        self.percentiles.clear();
    }

    /// Sorts the samples and derives every statistic from one pass of
    /// prefix sums. `values` must be non-empty.
    #[allow(clippy::cast_precision_loss)]
    fn finalize(&mut self, config: &AggregatorConfig) {
        self.values.sort_unstable_by(f64::total_cmp);
        let values = &self.values;
        let n = values.len();

        let mut cumulative = Vec::with_capacity(n);
        let mut cumulative_squares = Vec::with_capacity(n);
        let (mut sum, mut sum_squares) = (0.0, 0.0);
        for v in values {
            sum += v;
            sum_squares += v * v;
            cumulative.push(sum);
            cumulative_squares.push(sum_squares);
        }

        self.count = n;
        self.min = values[0];
        self.max = values[n - 1];
        self.sum = sum;
        self.sum_squares = sum_squares;
        self.mean = sum / n as f64;
        let mean = self.mean;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        self.std_dev = variance.sqrt();
        self.median = if n % 2 == 0 {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        } else {
            values[n / 2]
        };

        self.percentiles.clear();
        let disabled = config.disabled_subtypes;
        for threshold in &config.percent_thresholds {
            let in_threshold = if n == 1 {
                1
            } else {
                // bounded by n since |percent| <= 100
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let k = (threshold.percent.abs() / 100.0 * n as f64).round() as usize;
                k.min(n)
            };
            if in_threshold == 0 {
                continue;
            }

            let (sum, sum_squares, boundary) = if threshold.percent > 0.0 {
                let last = in_threshold - 1;
                (cumulative[last], cumulative_squares[last], values[last])
            } else {
                let first = n - in_threshold;
                let (below, below_squares) = if first == 0 {
                    (0.0, 0.0)
                } else {
                    (cumulative[first - 1], cumulative_squares[first - 1])
                };
                (
                    cumulative[n - 1] - below,
                    cumulative_squares[n - 1] - below_squares,
                    values[first],
                )
            };

            let suffix = threshold.suffix();
            let mut push = |enabled: bool, stat: &str, value: f64| {
                if enabled {
                    self.percentiles.push(Percentile {
                        name: format!("{stat}_{suffix}"),
                        value,
                    });
                }
            };
            push(!disabled.count, "count", in_threshold as f64);
            push(!disabled.mean, "mean", sum / in_threshold as f64);
            push(!disabled.sum, "sum", sum);
            push(!disabled.sum_squares, "sum_squares", sum_squares);
            if threshold.percent > 0.0 {
                push(!disabled.upper, "upper", boundary);
            } else {
                push(!disabled.lower, "lower", boundary);
            }
        }
    }

    /// Looks up a derived percentile statistic by name.
    #[must_use]
    pub fn percentile(&self, name: &str) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ustr::ustr;

    const INTERVAL: Duration = Duration::from_secs(10);

    fn metric(name: &str, metric_type: MetricType, value: f64) -> Metric {
        Metric::new(ustr(name), metric_type, value, Tags::parse("env:test"))
    }

    fn only<V: Clone>(map: &NamedMap<V>, name: &str) -> V {
        let tagged = map.get(&ustr(name)).unwrap();
        assert_eq!(tagged.len(), 1);
        tagged.values().next().unwrap().clone()
    }

    fn with_thresholds(thresholds: &[f64]) -> Aggregator {
        Aggregator::new(AggregatorConfig {
            percent_thresholds: thresholds.iter().copied().map(PercentThreshold::new).collect(),
            ..AggregatorConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_statistics() {
        let mut aggregator = with_thresholds(&[90.0]);
        let now = Instant::now();
        for v in [12.0, 2.0, 4.0] {
            aggregator.receive(metric("t", MetricType::Timer, v), now);
        }

        let timer = aggregator.flush(INTERVAL).process(|m| only(&m.timers, "t"));
        assert_eq!(timer.count, 3);
        assert_eq!(timer.min, 2.0);
        assert_eq!(timer.max, 12.0);
        assert_eq!(timer.mean, 6.0);
        assert_eq!(timer.median, 4.0);
        assert_eq!(timer.sum, 18.0);
        assert_eq!(timer.sum_squares, 164.0);
        assert!((timer.std_dev - 4.32).abs() < 0.01, "{}", timer.std_dev);
        assert!((timer.per_second - 0.3).abs() < 1e-9);
        assert_eq!(timer.percentile("count_90"), Some(3.0));
        assert_eq!(timer.percentile("mean_90"), Some(6.0));
        assert_eq!(timer.percentile("sum_90"), Some(18.0));
        assert_eq!(timer.percentile("upper_90"), Some(12.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upper_and_lower_tails() {
        let mut aggregator = with_thresholds(&[50.0, -50.0, 99.9]);
        let now = Instant::now();
        for v in 1..=10 {
            aggregator.receive(metric("t", MetricType::Timer, f64::from(v)), now);
        }
        let timer = aggregator.flush(INTERVAL).process(|m| only(&m.timers, "t"));

        assert_eq!(timer.median, 5.5);
        assert_eq!(timer.percentile("count_50"), Some(5.0));
        assert_eq!(timer.percentile("sum_50"), Some(15.0));
        assert_eq!(timer.percentile("upper_50"), Some(5.0));
        assert_eq!(timer.percentile("sum_squares_50"), Some(55.0));

        assert_eq!(timer.percentile("count_-50"), Some(5.0));
        assert_eq!(timer.percentile("sum_-50"), Some(40.0));
        assert_eq!(timer.percentile("mean_-50"), Some(8.0));
        assert_eq!(timer.percentile("lower_-50"), Some(6.0));
        assert_eq!(timer.percentile("upper_-50"), None);

        assert_eq!(timer.percentile("upper_99_9"), Some(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_thresholds_are_skipped_but_single_samples_are_not() {
        let mut aggregator = with_thresholds(&[1.0]);
        let now = Instant::now();
        for v in [1.0, 2.0, 3.0] {
            aggregator.receive(metric("many", MetricType::Timer, v), now);
        }
        aggregator.receive(metric("single", MetricType::Timer, 7.0), now);

        let (many, single) = aggregator
            .flush(INTERVAL)
            .process(|m| (only(&m.timers, "many"), only(&m.timers, "single")));
        assert!(many.percentiles.is_empty());
        assert_eq!(single.percentile("upper_1"), Some(7.0));
        assert_eq!(single.percentile("count_1"), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_subtypes_are_omitted() {
        let mut disabled = DisabledSubtypes::default();
        assert!(disabled.disable("sum_squares"));
        assert!(disabled.disable("upper"));
        assert!(!disabled.disable("median"));
        let mut aggregator = Aggregator::new(AggregatorConfig {
            disabled_subtypes: disabled,
            ..AggregatorConfig::default()
        });
        aggregator.receive(metric("t", MetricType::Timer, 1.0), Instant::now());

        let timer = aggregator.flush(INTERVAL).process(|m| only(&m.timers, "t"));
        let names: Vec<_> = timer.percentiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["count_90", "mean_90", "sum_90"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_rate() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        let now = Instant::now();
        aggregator.receive(metric("c", MetricType::Counter, 60.0), now);
        aggregator.receive(metric("c", MetricType::Counter, 40.0), now);

        let counter = aggregator.flush(INTERVAL).process(|m| only(&m.counters, "c"));
        assert_eq!(counter.value, 100.0);
        assert_eq!(counter.per_second, 10.0);

        let counter = aggregator.flush(Duration::ZERO).process(|m| only(&m.counters, "c"));
        assert_eq!(counter.per_second, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gauges_overwrite_and_sets_deduplicate() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        let now = Instant::now();
        aggregator.receive(metric("g", MetricType::Gauge, 1.0), now);
        aggregator.receive(metric("g", MetricType::Gauge, 7.0), now);
        for member in ["joe", "joe", "bob"] {
            aggregator.receive(
                Metric::new_set(ustr("s"), member.to_string(), Tags::new()),
                now,
            );
        }

        aggregator.flush(INTERVAL).process(|m| {
            assert_eq!(only(&m.gauges, "g").value, 7.0);
            let set = only(&m.sets, "s");
            assert_eq!(set.values.len(), 2);
            assert!(set.values.contains("joe") && set.values.contains("bob"));
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_tag_variants_are_separate_accumulators() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        let now = Instant::now();
        let mut a = Metric::new(ustr("c"), MetricType::Counter, 1.0, Tags::parse("x:1,y:2"));
        let b = Metric::new(ustr("c"), MetricType::Counter, 1.0, Tags::parse("y:2,x:1"));
        let mut c = Metric::new(ustr("c"), MetricType::Counter, 1.0, Tags::parse("x:1,y:2"));
        c.hostname = "web-1".to_string();
        a.hostname = String::new();
        aggregator.receive(a, now);
        aggregator.receive(b, now);
        aggregator.receive(c, now);

        aggregator.flush(INTERVAL).process(|m| {
            let tagged = m.counters.get(&ustr("c")).unwrap();
            assert_eq!(tagged.len(), 2);
            assert_eq!(tagged.get("x:1,y:2").unwrap().value, 2.0);
            assert_eq!(tagged.get("x:1,y:2,s:web-1").unwrap().value, 1.0);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_window_but_keeps_gauges() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        let now = Instant::now();
        aggregator.receive(metric("c", MetricType::Counter, 5.0), now);
        aggregator.receive(metric("g", MetricType::Gauge, 3.0), now);
        aggregator.receive(metric("t", MetricType::Timer, 3.0), now);
        aggregator.receive(Metric::new_set(ustr("s"), "a".to_string(), Tags::new()), now);
        aggregator.flush(INTERVAL).reset(now);

        let later = now + INTERVAL;
        aggregator.flush(INTERVAL).process(|m| {
            assert_eq!(m.len(), 4);
            assert_eq!(only(&m.counters, "c").value, 0.0);
            assert_eq!(only(&m.gauges, "g").value, 3.0);
            let timer = only(&m.timers, "t");
            assert!(timer.values.is_empty());
            assert_eq!(timer.count, 0);
            assert!(only(&m.sets, "s").values.is_empty());
        });
        aggregator.flush(INTERVAL).reset(later);
        assert!(!aggregator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_accumulators_expire() {
        let mut aggregator = Aggregator::new(AggregatorConfig {
            expiry_interval: Duration::from_secs(30),
            ..AggregatorConfig::default()
        });
        let start = Instant::now();
        aggregator.receive(metric("old", MetricType::Gauge, 1.0), start);
        aggregator.receive(metric("c", MetricType::Counter, 1.0), start);
        aggregator.receive(metric("c", MetricType::Counter, 1.0), start + Duration::from_secs(20));

        // not yet past the interval
        aggregator.flush(INTERVAL).reset(start + Duration::from_secs(30));
        aggregator.flush(INTERVAL).process(|m| assert_eq!(m.len(), 2));

        aggregator.flush(INTERVAL).reset(start + Duration::from_secs(31));
        aggregator.flush(INTERVAL).process(|m| {
            assert!(m.gauges.is_empty());
            assert_eq!(m.counters.len(), 1);
        });

        aggregator.flush(INTERVAL).reset(start + Duration::from_secs(51));
        assert!(aggregator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_expiry_never_expires() {
        let mut aggregator = Aggregator::new(AggregatorConfig {
            expiry_interval: Duration::ZERO,
            ..AggregatorConfig::default()
        });
        let start = Instant::now();
        aggregator.receive(metric("g", MetricType::Gauge, 1.0), start);
        aggregator.flush(INTERVAL).reset(start + Duration::from_secs(86_400));
        assert!(!aggregator.is_empty());
    }

    #[test]
    fn test_threshold_suffix() {
        assert_eq!(PercentThreshold::new(90.0).suffix(), "90");
        assert_eq!(PercentThreshold::new(99.9).suffix(), "99_9");
        assert_eq!(PercentThreshold::new(-10.0).suffix(), "-10");
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_snapshots() {
        let now = Instant::now();
        let mut a = Aggregator::new(AggregatorConfig::default());
        let mut b = Aggregator::new(AggregatorConfig::default());
        a.receive(metric("x", MetricType::Counter, 1.0), now);
        b.receive(metric("y", MetricType::Gauge, 1.0), now);

        let mut merged = a.flush(INTERVAL).process(Clone::clone);
        b.flush(INTERVAL).process(|m| merged.merge(m));
        assert_eq!(merged.len(), 2);
    }
}
