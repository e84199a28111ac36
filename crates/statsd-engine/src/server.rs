// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires every stage together.
//!
//! ```text
//! receivers -> datagram queue -> parsers -> tags -> [cloud] -> dispatcher
//!                                                               |      |
//!                                                        workers  backends
//! ```
//!
//! Shutdown runs in pipeline order once the cancellation token fires:
//! receivers and parsers stop, the cloud stage forwards what it still holds,
//! the flusher runs a final flush within the grace period, and only then
//! are the aggregation workers stopped.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::aggregator_service::AggregatorService;
use crate::backend::Backend;
use crate::buffer_pool::BufferPool;
use crate::cloud::handler::cloud_stage;
use crate::cloud::CloudProvider;
use crate::config::EngineConfig;
use crate::constants::{BUFFERS_PER_RECEIVER, DATAGRAM_QUEUE_SIZE, WORKER_QUEUE_SIZE};
use crate::dispatcher::Dispatcher;
use crate::errors::ServerError;
use crate::flusher::{FlushStatus, Flusher, FlusherConfig};
use crate::handler::PipelineHandler;
use crate::rate_limit::TokenBucket;
use crate::receiver::{bind_sockets, DatagramReceiver, ReceiverStats};
use crate::stats::StatsSource;
use crate::statsd::{DatagramQueue, ParserStats, StatsdParser};
use crate::tag_handler::TagHandler;

/// A running engine.
pub struct Server {
    local_addrs: Vec<SocketAddr>,
    status: Arc<FlushStatus>,
    supervisor: JoinHandle<()>,
}

struct Tasks {
    receivers: Vec<JoinHandle<()>>,
    parsers: Vec<JoinHandle<()>>,
    cloud: Option<JoinHandle<()>>,
    flusher: JoinHandle<()>,
    /// Fired once everything upstream of the workers has drained
    flusher_cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Validates `config`, binds every listen address and spawns the
    /// pipeline. Must be called from within a tokio runtime.
    pub fn start(
        config: &EngineConfig,
        backends: Vec<Arc<dyn Backend>>,
        provider: Option<Arc<dyn CloudProvider>>,
        cancel: CancellationToken,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let mut sockets = Vec::new();
        let mut local_addrs = Vec::with_capacity(config.listen_addrs.len());
        for addr in &config.listen_addrs {
            let bound = bind_sockets(addr, config.receivers, config.reuse_port)?;
            if let Some(local) = bound.first().and_then(|s| s.local_addr().ok()) {
                local_addrs.push(local);
            }
            sockets.extend(bound);
        }

        let backends: Arc<[Arc<dyn Backend>]> = Arc::from(backends);
        let tracker = TaskTracker::new();

        let mut workers = Vec::with_capacity(config.workers);
        let mut worker_tasks = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let (service, handle) =
                AggregatorService::new(id, config.aggregator_config(), WORKER_QUEUE_SIZE);
            worker_tasks.push(tokio::spawn(service.run()));
            workers.push(handle);
        }
        let dispatcher = Arc::new(Dispatcher::new(
            workers,
            Arc::clone(&backends),
            tracker.clone(),
        ));

        let mut stats_sources: Vec<Arc<dyn StatsSource>> = Vec::new();
        let mut head: Arc<dyn PipelineHandler> = dispatcher.clone();
        let mut cloud = None;
        if let Some(provider) = provider {
            info!(provider = provider.name(), "cloud enrichment enabled");
            let (handler, service, lookups) =
                cloud_stage(provider, &config.cloud_options(), head);
            stats_sources.push(Arc::new(handler.cache().clone()));
            cloud = Some(tokio::spawn(service.run(lookups, cancel.clone())));
            head = Arc::new(handler);
        }
        let head: Arc<dyn PipelineHandler> =
            Arc::new(TagHandler::new(config.default_tags.clone(), head));

        // one spare byte per buffer exposes datagrams over the limit
        let pool = BufferPool::new(
            BUFFERS_PER_RECEIVER * sockets.len(),
            config.max_datagram_size.saturating_add(1),
        );
        let bad_line_limiter = (config.bad_lines_per_minute > 0.0)
            .then(|| Arc::new(TokenBucket::per_minute(config.bad_lines_per_minute)));
        let receiver_stats = Arc::new(ReceiverStats::default());
        let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_QUEUE_SIZE);
        let receivers = sockets
            .into_iter()
            .enumerate()
            .map(|(id, socket)| {
                let receiver = DatagramReceiver::new(
                    id,
                    socket,
                    Arc::clone(&pool),
                    config.receive_batch_size,
                    config.max_datagram_size,
                    Arc::clone(&receiver_stats),
                    datagram_tx.clone(),
                )
                .with_oversize_limiter(bad_line_limiter.clone());
                tokio::spawn(receiver.run(cancel.clone()))
            })
            .collect();
        drop(datagram_tx);

        let parser_stats = Arc::new(ParserStats::default());
        let queue: DatagramQueue = Arc::new(Mutex::new(datagram_rx));
        let parsers = (0..config.parsers)
            .map(|id| {
                let parser = StatsdParser::new(
                    id,
                    Arc::clone(&head),
                    config.namespace.clone(),
                    bad_line_limiter.clone(),
                    Arc::clone(&parser_stats),
                );
                tokio::spawn(parser.run(Arc::clone(&queue), cancel.clone()))
            })
            .collect();

        stats_sources.push(receiver_stats);
        stats_sources.push(parser_stats);
        stats_sources.push(pool);
        let flusher = Flusher::new(FlusherConfig {
            dispatcher: Arc::clone(&dispatcher),
            backends,
            interval: config.flush_interval,
            stats_sources,
            internal_tags: config.internal_tags.clone(),
            tracker,
            shutdown_grace: config.shutdown_grace,
        });
        let status = flusher.status();
        let flusher_cancel = CancellationToken::new();
        let flusher = tokio::spawn(flusher.run(flusher_cancel.clone()));

        info!(
            addrs = ?local_addrs,
            workers = config.workers,
            parsers = config.parsers,
            "statsd engine listening"
        );

        let tasks = Tasks {
            receivers,
            parsers,
            cloud,
            flusher,
            flusher_cancel,
            workers: worker_tasks,
        };
        let supervisor = tokio::spawn(supervise(tasks, dispatcher));

        Ok(Self {
            local_addrs,
            status,
            supervisor,
        })
    }

    /// Resolved listen addresses, one per configured address.
    #[must_use]
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    #[must_use]
    pub fn flush_status(&self) -> Arc<FlushStatus> {
        Arc::clone(&self.status)
    }

    /// Waits until every stage has stopped after cancellation.
    pub async fn wait(self) {
        if let Err(e) = self.supervisor.await {
            error!("statsd engine supervisor failed: {}", e);
        }
    }
}

async fn join(stage: &str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(stage, "task failed: {}", e);
        }
    }
}

async fn supervise(tasks: Tasks, dispatcher: Arc<Dispatcher>) {
    join("receiver", tasks.receivers).await;
    join("parser", tasks.parsers).await;
    if let Some(cloud) = tasks.cloud {
        join("cloud", vec![cloud]).await;
    }
    tasks.flusher_cancel.cancel();
    join("flusher", vec![tasks.flusher]).await;

    dispatcher.shutdown().await;
    join("aggregator", tasks.workers).await;
    debug!("statsd engine stopped");
}
