// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::backend::{Backend, Snapshot};
use crate::dispatcher::Dispatcher;
use crate::errors::BackendError;
use crate::handler::PipelineHandler;
use crate::metric::Tags;
use crate::stats::{self, StatsSource};
use crate::util::unix_now;

/// Unix timestamps of the last clean and the last failed flush, readable
/// while the flusher runs. Zero means never.
#[derive(Debug, Default)]
pub struct FlushStatus {
    last_flush: AtomicI64,
    last_flush_error: AtomicI64,
}

impl FlushStatus {
    #[must_use]
    pub fn last_flush(&self) -> i64 {
        self.last_flush.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_flush_error(&self) -> i64 {
        self.last_flush_error.load(Ordering::Acquire)
    }
}

pub struct FlusherConfig {
    pub dispatcher: Arc<Dispatcher>,
    pub backends: Arc<[Arc<dyn Backend>]>,
    pub interval: Duration,
    pub stats_sources: Vec<Arc<dyn StatsSource>>,
    pub internal_tags: Tags,
    /// Shared with the dispatcher's event sends
    pub tracker: TaskTracker,
    pub shutdown_grace: Duration,
}

pub struct Flusher {
    dispatcher: Arc<Dispatcher>,
    backends: Arc<[Arc<dyn Backend>]>,
    interval: Duration,
    stats_sources: Vec<Arc<dyn StatsSource>>,
    internal_tags: Tags,
    tracker: TaskTracker,
    shutdown_grace: Duration,
    status: Arc<FlushStatus>,
}

type SendResult = Result<(), Vec<BackendError>>;

impl Flusher {
    #[must_use]
    pub fn new(config: FlusherConfig) -> Self {
        Flusher {
            dispatcher: config.dispatcher,
            backends: config.backends,
            interval: config.interval,
            stats_sources: config.stats_sources,
            internal_tags: config.internal_tags,
            tracker: config.tracker,
            shutdown_grace: config.shutdown_grace,
            status: Arc::new(FlushStatus::default()),
        }
    }

    #[must_use]
    pub fn status(&self) -> Arc<FlushStatus> {
        Arc::clone(&self.status)
    }

    /// Flushes every interval until cancelled, then runs a last flush and
    /// waits for in-flight sends, all within the shutdown grace period.
    pub async fn run(self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // workers reset as they reply, so a started cycle must deliver
            let cycle = self.flush();
            tokio::pin!(cycle);
            tokio::select! {
                biased;
                () = &mut cycle => {}
                _ = cancel.cancelled() => {
                    if tokio::time::timeout(self.shutdown_grace, cycle).await.is_err() {
                        warn!(
                            "Flush in progress did not finish within {:?}",
                            self.shutdown_grace
                        );
                    }
                    break;
                }
            }
        }

        debug!("Flusher stopping, final flush");
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            self.flush().await;
            self.tracker.close();
            self.tracker.wait().await;
        })
        .await;
        if drained.is_err() {
            warn!(
                "Backend sends still in flight after {:?}, giving up",
                self.shutdown_grace
            );
        }
    }

    /// One flush cycle: report internal metrics, flush every worker, send
    /// each snapshot to every backend and wait for all sends.
    pub async fn flush(&self) {
        let internal = stats::collect(&self.stats_sources, &self.internal_tags);
        if !internal.is_empty() {
            self.dispatcher.dispatch_metrics(internal).await;
        }

        let timestamp = unix_now();
        let mut failed = false;
        let mut sends: Vec<(String, JoinHandle<SendResult>)> = Vec::new();

        let results = self.dispatcher.flush_all(self.interval).await;
        for (worker, result) in results.into_iter().enumerate() {
            let metrics = match result {
                Ok(metrics) => metrics,
                Err(e) => {
                    error!("Failed to flush aggregation worker {}: {}", worker, e);
                    failed = true;
                    continue;
                }
            };
            if metrics.is_empty() {
                continue;
            }

            let snapshot = Arc::new(Snapshot {
                worker,
                timestamp,
                interval: self.interval,
                metrics,
            });
            for backend in self.backends.iter() {
                let backend = Arc::clone(backend);
                let snapshot = Arc::clone(&snapshot);
                let name = backend.name().to_string();
                let handle = self
                    .tracker
                    .spawn(async move { backend.send_metrics(snapshot).await });
                sends.push((name, handle));
            }
        }

        for (backend, handle) in sends {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(errors)) => {
                    failed = true;
                    for e in errors {
                        error!(backend = backend.as_str(), "Failed to send metrics: {}", e);
                    }
                }
                Err(e) => {
                    failed = true;
                    error!(backend = backend.as_str(), "Metric send task failed: {}", e);
                }
            }
        }

        if failed {
            self.status.last_flush_error.store(timestamp, Ordering::Release);
        } else {
            self.status.last_flush.store(timestamp, Ordering::Release);
            debug!("Flush completed");
        }
    }
}
