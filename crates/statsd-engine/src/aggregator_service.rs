// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::aggregator::{AggregatedMetrics, Aggregator, AggregatorConfig};
use crate::errors::AggregatorError;
use crate::metric::Metric;

#[derive(Debug)]
pub enum AggregatorCommand {
    Receive(Vec<Metric>),
    Flush {
        interval: Duration,
        response_tx: oneshot::Sender<Arc<AggregatedMetrics>>,
    },
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct AggregatorHandle {
    id: usize,
    tx: mpsc::Sender<AggregatorCommand>,
}

impl AggregatorHandle {
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queues a batch, waiting for room in the worker's queue.
    pub async fn receive(&self, metrics: Vec<Metric>) -> Result<(), AggregatorError> {
        self.tx
            .send(AggregatorCommand::Receive(metrics))
            .await
            .map_err(|_| AggregatorError::WorkerClosed(self.id))
    }

    /// Flushes, snapshots and resets the worker's window.
    pub async fn flush(
        &self,
        interval: Duration,
    ) -> Result<Arc<AggregatedMetrics>, AggregatorError> {
        self.request_flush(interval).await?.wait().await
    }

    /// Queues a flush without waiting for it, so several workers can flush
    /// at the same time.
    pub async fn request_flush(&self, interval: Duration) -> Result<PendingFlush, AggregatorError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(AggregatorCommand::Flush {
                interval,
                response_tx,
            })
            .await
            .map_err(|_| AggregatorError::WorkerClosed(self.id))?;
        Ok(PendingFlush {
            id: self.id,
            response_rx,
        })
    }

    pub async fn shutdown(&self) -> Result<(), AggregatorError> {
        self.tx
            .send(AggregatorCommand::Shutdown)
            .await
            .map_err(|_| AggregatorError::WorkerClosed(self.id))
    }
}

#[derive(Debug)]
pub struct PendingFlush {
    id: usize,
    response_rx: oneshot::Receiver<Arc<AggregatedMetrics>>,
}

impl PendingFlush {
    pub async fn wait(self) -> Result<Arc<AggregatedMetrics>, AggregatorError> {
        self.response_rx
            .await
            .map_err(|_| AggregatorError::ResponseDropped(self.id))
    }
}

/// An aggregation worker: the only owner of its [`Aggregator`]. Updates and
/// flushes arrive on the same queue, so a flush never interleaves with a
/// receive.
pub struct AggregatorService {
    id: usize,
    aggregator: Aggregator,
    rx: mpsc::Receiver<AggregatorCommand>,
}

impl AggregatorService {
    #[must_use]
    pub fn new(
        id: usize,
        config: AggregatorConfig,
        queue_size: usize,
    ) -> (Self, AggregatorHandle) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let service = Self {
            id,
            aggregator: Aggregator::new(config),
            rx,
        };
        (service, AggregatorHandle { id, tx })
    }

    /// Runs until a shutdown command arrives or every handle is dropped.
    pub async fn run(mut self) {
        debug!(worker = self.id, "Aggregator service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                AggregatorCommand::Receive(metrics) => {
                    let now = Instant::now();
                    for metric in metrics {
                        self.aggregator.receive(metric, now);
                    }
                }

                AggregatorCommand::Flush {
                    interval,
                    response_tx,
                } => {
                    let window = self.aggregator.flush(interval);
                    let snapshot = window.process(|metrics| Arc::new(metrics.clone()));
                    window.reset(Instant::now());

                    if response_tx.send(snapshot).is_err() {
                        error!(
                            worker = self.id,
                            "Failed to send flush response - receiver dropped"
                        );
                    }
                }

                AggregatorCommand::Shutdown => {
                    debug!(worker = self.id, "Aggregator service shutting down");
                    break;
                }
            }
        }

        debug!(worker = self.id, "Aggregator service stopped");
    }
}
