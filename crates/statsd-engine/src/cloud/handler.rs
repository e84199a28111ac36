// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::cache::{new_cache, CacheOptions, CacheReader, CacheStats, CacheWriter};
use super::lookup::{LookupDispatcher, LookupResult};
use super::{CloudProvider, Instance};
use crate::handler::PipelineHandler;
use crate::metric::{Event, Metric};
use crate::rate_limit::TokenBucket;

/// Items that missed the cache, waiting for their source address to resolve.
#[derive(Debug)]
pub enum CacheMiss {
    Metrics(Vec<Metric>),
    Event(Box<Event>),
}

/// Pipeline stage that tags metrics and events with the instance behind
/// their source address. Cache hits go straight through; misses are handed
/// to the [`CloudService`].
pub struct CloudHandler {
    cache: CacheReader,
    misses: mpsc::Sender<CacheMiss>,
    next: Arc<dyn PipelineHandler>,
}

#[derive(Clone, Debug)]
pub struct CloudOptions {
    pub cache: CacheOptions,
    /// Provider calls per second, 0 for unlimited
    pub rate_limit: f64,
    pub max_concurrent: usize,
    pub batch_window: Duration,
    pub queue_size: usize,
}

/// Wires the handler, the cache owner and the lookup dispatcher together.
/// The returned tasks must be spawned by the caller.
#[must_use]
pub fn cloud_stage(
    provider: Arc<dyn CloudProvider>,
    options: &CloudOptions,
    next: Arc<dyn PipelineHandler>,
) -> (CloudHandler, CloudService, LookupDispatcher) {
    let stats = Arc::new(CacheStats::default());
    let (reader, writer) = new_cache(Arc::clone(&stats));
    let (miss_tx, miss_rx) = mpsc::channel(options.queue_size.max(1));
    let (lookup_tx, lookup_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = mpsc::unbounded_channel();

    // burst of one provider call per permit
    let burst = u32::try_from(options.max_concurrent.max(1)).unwrap_or(u32::MAX);
    let limiter = (options.rate_limit > 0.0)
        .then(|| Arc::new(TokenBucket::new(options.rate_limit, burst)));
    let dispatcher = LookupDispatcher::new(
        provider,
        limiter,
        options.max_concurrent,
        options.batch_window,
        stats,
    );
    let handler = CloudHandler {
        cache: reader.clone(),
        misses: miss_tx,
        next: Arc::clone(&next),
    };
    let service = CloudService {
        writer,
        reader,
        options: options.cache,
        misses: miss_rx,
        lookups: lookup_tx,
        lookup_requests: Some(lookup_rx),
        results: result_rx,
        result_tx: Some(result_tx),
        next,
        awaiting: HashMap::new(),
        refreshing: HashSet::new(),
    };
    (handler, service, dispatcher)
}

impl CloudHandler {
    #[must_use]
    pub fn cache(&self) -> &CacheReader {
        &self.cache
    }
}

#[async_trait::async_trait]
impl PipelineHandler for CloudHandler {
    async fn dispatch_metrics(&self, metrics: Vec<Metric>) {
        let mut ready = Vec::with_capacity(metrics.len());
        let mut missed = Vec::new();
        for mut metric in metrics {
            let Some(ip) = metric.source_ip else {
                ready.push(metric);
                continue;
            };
            match self.cache.get(ip) {
                Some(instance) => {
                    enrich_metric(&mut metric, instance.as_deref());
                    ready.push(metric);
                }
                None => missed.push(metric),
            }
        }

        if !missed.is_empty() {
            if let Err(mpsc::error::SendError(CacheMiss::Metrics(missed))) =
                self.misses.send(CacheMiss::Metrics(missed)).await
            {
                debug!("cloud cache owner stopped, forwarding metrics unenriched");
                ready.extend(missed);
            }
        }
        if !ready.is_empty() {
            self.next.dispatch_metrics(ready).await;
        }
    }

    async fn dispatch_event(&self, mut event: Event) {
        let Some(ip) = event.source_ip else {
            self.next.dispatch_event(event).await;
            return;
        };
        match self.cache.get(ip) {
            Some(instance) => {
                enrich_event(&mut event, instance.as_deref());
                self.next.dispatch_event(event).await;
            }
            None => {
                if let Err(mpsc::error::SendError(CacheMiss::Event(event))) =
                    self.misses.send(CacheMiss::Event(Box::new(event))).await
                {
                    debug!("cloud cache owner stopped, forwarding event unenriched");
                    self.next.dispatch_event(*event).await;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Awaiting {
    metrics: Vec<Metric>,
    events: Vec<Event>,
}

/// The only task that mutates the instance cache. Coalesces misses so each
/// address has at most one lookup in flight, applies lookup results, and
/// periodically refreshes expired entries and evicts idle ones.
pub struct CloudService {
    writer: CacheWriter,
    reader: CacheReader,
    options: CacheOptions,
    misses: mpsc::Receiver<CacheMiss>,
    lookups: mpsc::UnboundedSender<IpAddr>,
    lookup_requests: Option<mpsc::UnboundedReceiver<IpAddr>>,
    results: mpsc::UnboundedReceiver<Vec<LookupResult>>,
    result_tx: Option<mpsc::UnboundedSender<Vec<LookupResult>>>,
    next: Arc<dyn PipelineHandler>,
    awaiting: HashMap<IpAddr, Awaiting>,
    refreshing: HashSet<IpAddr>,
}

impl CloudService {
    #[must_use]
    pub fn cache(&self) -> &CacheReader {
        &self.reader
    }

    /// Runs the cache owner together with `dispatcher` until cancelled.
    /// Items still waiting for a lookup at shutdown are forwarded
    /// unenriched.
    pub async fn run(mut self, dispatcher: LookupDispatcher, cancel: CancellationToken) {
        let (Some(requests), Some(result_tx)) = (self.lookup_requests.take(), self.result_tx.take())
        else {
            return;
        };
        let lookups = tokio::spawn(dispatcher.run(requests, result_tx, cancel.clone()));

        let period = self.options.refresh_period.max(Duration::from_millis(1));
        let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(results) = self.results.recv() => self.apply_results(results).await,
                miss = self.misses.recv() => match miss {
                    Some(miss) => self.handle_miss(miss).await,
                    None => break,
                },
                _ = refresh.tick() => self.refresh(),
            }
        }

        self.drain_awaiting().await;
        let _ = lookups.await;
        debug!("cloud cache owner stopped");
    }

    async fn handle_miss(&mut self, miss: CacheMiss) {
        match miss {
            CacheMiss::Metrics(metrics) => {
                let mut ready = Vec::new();
                for mut metric in metrics {
                    let Some(ip) = metric.source_ip else {
                        ready.push(metric);
                        continue;
                    };
                    // resolved while this batch was queued
                    if let Some(instance) = self.writer.peek(ip) {
                        enrich_metric(&mut metric, instance.as_deref());
                        ready.push(metric);
                    } else {
                        self.await_lookup(ip).metrics.push(metric);
                    }
                }
                if !ready.is_empty() {
                    self.next.dispatch_metrics(ready).await;
                }
            }
            CacheMiss::Event(event) => {
                let mut event = *event;
                let Some(ip) = event.source_ip else {
                    self.next.dispatch_event(event).await;
                    return;
                };
                if let Some(instance) = self.writer.peek(ip) {
                    enrich_event(&mut event, instance.as_deref());
                    self.next.dispatch_event(event).await;
                } else {
                    self.await_lookup(ip).events.push(event);
                }
            }
        }
    }

    /// Queue slot for `ip`, requesting a lookup if none is in flight.
    fn await_lookup(&mut self, ip: IpAddr) -> &mut Awaiting {
        let in_flight = self.awaiting.contains_key(&ip) || self.refreshing.contains(&ip);
        if !in_flight {
            let _ = self.lookups.send(ip);
        }
        self.awaiting.entry(ip).or_default()
    }

    async fn apply_results(&mut self, results: Vec<LookupResult>) {
        let mut ready = Vec::new();
        for LookupResult { ip, outcome } in results {
            let refreshed = self.refreshing.remove(&ip);
            let Some(awaiting) = self.awaiting.remove(&ip) else {
                if refreshed {
                    self.writer.apply_refresh(ip, outcome, &self.options);
                } else {
                    self.writer.apply(ip, outcome, &self.options);
                }
                continue;
            };
            self.writer.apply(ip, outcome, &self.options);
            let instance = self.writer.peek(ip).flatten();
            for mut metric in awaiting.metrics {
                enrich_metric(&mut metric, instance.as_deref());
                ready.push(metric);
            }
            for mut event in awaiting.events {
                enrich_event(&mut event, instance.as_deref());
                self.next.dispatch_event(event).await;
            }
        }
        if !ready.is_empty() {
            self.next.dispatch_metrics(ready).await;
        }
    }

    fn refresh(&mut self) {
        let expired = self.writer.sweep(self.options.evict_after_idle);
        let mut requested = 0;
        for ip in expired {
            if self.awaiting.contains_key(&ip) || !self.refreshing.insert(ip) {
                continue;
            }
            let _ = self.lookups.send(ip);
            requested += 1;
        }
        debug!(
            entries = self.reader.len(),
            refreshing = requested,
            "cloud cache sweep"
        );
    }

    async fn drain_awaiting(&mut self) {
        let mut metrics = Vec::new();
        self.misses.close();
        while let Ok(miss) = self.misses.try_recv() {
            match miss {
                CacheMiss::Metrics(batch) => metrics.extend(batch),
                CacheMiss::Event(event) => self.next.dispatch_event(*event).await,
            }
        }
        for (_, awaiting) in self.awaiting.drain() {
            metrics.extend(awaiting.metrics);
            for event in awaiting.events {
                self.next.dispatch_event(event).await;
            }
        }
        if !metrics.is_empty() {
            self.next.dispatch_metrics(metrics).await;
        }
    }
}

fn enrich_metric(metric: &mut Metric, instance: Option<&Instance>) {
    if let Some(instance) = instance {
        metric.tags.extend_from(&instance.tags);
        metric.hostname.clone_from(&instance.id);
    }
}

fn enrich_event(event: &mut Event, instance: Option<&Instance>) {
    if let Some(instance) = instance {
        event.tags.extend_from(&instance.tags);
        event.hostname.clone_from(&instance.id);
    }
}
