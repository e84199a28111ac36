// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Last stage of the handler chain: routes metrics to their aggregation
//! worker and events to every backend.

use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHasher;
use tokio_util::task::TaskTracker;
use tracing::error;

use crate::aggregator::AggregatedMetrics;
use crate::aggregator_service::AggregatorHandle;
use crate::backend::Backend;
use crate::errors::AggregatorError;
use crate::handler::PipelineHandler;
use crate::metric::{Event, Metric};

/// Worker index for a metric name. Stable for a given worker count.
#[must_use]
pub fn shard_index(name: &str, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    let mut hasher = FnvHasher::default();
    hasher.write(name.as_bytes());
    // the remainder is below `workers`, which is a usize
    #[allow(clippy::cast_possible_truncation)]
    let index = (hasher.finish() % workers as u64) as usize;
    index
}

pub struct Dispatcher {
    workers: Vec<AggregatorHandle>,
    backends: Arc<[Arc<dyn Backend>]>,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// `tracker` receives every event send so shutdown can wait for them.
    #[must_use]
    pub fn new(
        workers: Vec<AggregatorHandle>,
        backends: Arc<[Arc<dyn Backend>]>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            workers,
            backends,
            tracker,
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Flushes every worker concurrently and returns their snapshots in
    /// worker order.
    pub async fn flush_all(
        &self,
        interval: Duration,
    ) -> Vec<Result<Arc<AggregatedMetrics>, AggregatorError>> {
        let mut pending = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            pending.push(worker.request_flush(interval).await);
        }

        let mut snapshots = Vec::with_capacity(pending.len());
        for request in pending {
            snapshots.push(match request {
                Ok(flush) => flush.wait().await,
                Err(e) => Err(e),
            });
        }
        snapshots
    }

    /// Stops every worker after it has drained its queue.
    pub async fn shutdown(&self) {
        for worker in &self.workers {
            if let Err(e) = worker.shutdown().await {
                error!("Failed to stop aggregation worker: {}", e);
            }
        }
    }
}

#[async_trait::async_trait]
impl PipelineHandler for Dispatcher {
    async fn dispatch_metrics(&self, metrics: Vec<Metric>) {
        if self.workers.is_empty() {
            return;
        }
        let mut shards: Vec<Vec<Metric>> = vec![Vec::new(); self.workers.len()];
        for metric in metrics {
            shards[shard_index(&metric.name, self.workers.len())].push(metric);
        }

        for (worker, shard) in self.workers.iter().zip(shards) {
            if shard.is_empty() {
                continue;
            }
            if let Err(e) = worker.receive(shard).await {
                error!("Dropping metrics: {}", e);
            }
        }
    }

    async fn dispatch_event(&self, event: Event) {
        let event = Arc::new(event);
        for backend in self.backends.iter() {
            let backend = Arc::clone(backend);
            let event = Arc::clone(&event);
            self.tracker.spawn(async move {
                if let Err(e) = backend.send_event(&event).await {
                    error!(backend = backend.name(), "Failed to send event: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::aggregator::AggregatorConfig;
    use crate::aggregator_service::AggregatorService;
    use crate::backend::Snapshot;
    use crate::errors::BackendError;
    use crate::metric::{MetricType, Tags};
    use proptest::prelude::*;
    use std::sync::Mutex;
    use ustr::ustr;

    /// Records what it is sent; optionally fails every call.
    #[derive(Default)]
    pub(crate) struct RecordingBackend {
        pub snapshots: Mutex<Vec<Arc<Snapshot>>>,
        pub events: Mutex<Vec<Event>>,
        pub fail: bool,
    }

    #[async_trait::async_trait]
    impl Backend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send_metrics(&self, snapshot: Arc<Snapshot>) -> Result<(), Vec<BackendError>> {
            self.snapshots.lock().unwrap().push(snapshot);
            if self.fail {
                return Err(vec![BackendError::new("recording", "refused")]);
            }
            Ok(())
        }

        async fn send_event(&self, event: &Event) -> Result<(), BackendError> {
            self.events.lock().unwrap().push(event.clone());
            if self.fail {
                return Err(BackendError::new("recording", "refused"));
            }
            Ok(())
        }
    }

    pub(crate) fn spawn_workers(n: usize) -> Vec<AggregatorHandle> {
        (0..n)
            .map(|id| {
                let (service, handle) = AggregatorService::new(id, AggregatorConfig::default(), 64);
                tokio::spawn(service.run());
                handle
            })
            .collect()
    }

    proptest! {
        #[test]
        fn test_shard_index_is_stable(name in "\\PC*", workers in 1usize..64) {
            let first = shard_index(&name, workers);
            prop_assert!(first < workers);
            prop_assert_eq!(first, shard_index(&name, workers));
        }
    }

    #[tokio::test]
    async fn test_metrics_with_one_name_land_on_one_worker() {
        let dispatcher =
            Dispatcher::new(spawn_workers(4), Arc::from(Vec::new()), TaskTracker::new());
        let metrics: Vec<_> = (0..20)
            .map(|i| {
                Metric::new(
                    ustr("requests"),
                    MetricType::Counter,
                    1.0,
                    Tags::parse(&format!("shard:{}", i % 3)),
                )
            })
            .collect();
        dispatcher.dispatch_metrics(metrics).await;
        dispatcher
            .dispatch_metrics(vec![Metric::new(ustr("other"), MetricType::Gauge, 2.0, Tags::new())])
            .await;

        let snapshots = dispatcher.flush_all(Duration::from_secs(10)).await;
        assert_eq!(snapshots.len(), 4);
        let owner = shard_index("requests", 4);
        for (worker, snapshot) in snapshots.into_iter().enumerate() {
            let snapshot = snapshot.unwrap();
            let counters = snapshot.counters.get(&ustr("requests"));
            if worker == owner {
                let total: f64 = counters.unwrap().values().map(|c| c.value).sum();
                assert_eq!(total, 20.0);
                assert_eq!(counters.unwrap().len(), 3);
            } else {
                assert!(counters.is_none());
            }
        }
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_reach_every_backend() {
        let ok = Arc::new(RecordingBackend::default());
        let failing = Arc::new(RecordingBackend {
            fail: true,
            ..RecordingBackend::default()
        });
        let backends: Arc<[Arc<dyn Backend>]> = Arc::new([
            Arc::clone(&ok) as Arc<dyn Backend>,
            Arc::clone(&failing) as Arc<dyn Backend>,
        ]);
        let tracker = TaskTracker::new();
        let dispatcher = Dispatcher::new(Vec::new(), backends, tracker.clone());

        dispatcher
            .dispatch_event(Event {
                title: "deploy".to_string(),
                ..Event::default()
            })
            .await;
        tracker.close();
        tracker.wait().await;

        assert_eq!(ok.events.lock().unwrap().len(), 1);
        assert_eq!(failing.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_reports_stopped_workers() {
        let workers = spawn_workers(2);
        workers[1].shutdown().await.unwrap();
        let dispatcher = Dispatcher::new(workers, Arc::from(Vec::new()), TaskTracker::new());
        let snapshots = dispatcher.flush_all(Duration::from_secs(1)).await;
        assert!(snapshots[0].is_ok());
        assert!(snapshots[1].is_err());
    }
}
