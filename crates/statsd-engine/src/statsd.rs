// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parser stage: splits received datagrams into lines, parses them and feeds
//! the results into the handler chain.
//!
//! Several parsers share one datagram queue. A datagram is dropped, and its
//! buffer returned to the pool, as soon as its lines have been parsed.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::errors::ParseError;
use crate::handler::PipelineHandler;
use crate::lexer::{parse_line, Parsed};
use crate::metric::{Event, Metric};
use crate::rate_limit::TokenBucket;
use crate::receiver::Datagram;
use crate::util::unix_now;

pub type DatagramQueue = Arc<Mutex<mpsc::Receiver<Vec<Datagram>>>>;

#[derive(Debug, Default)]
pub struct ParserStats {
    pub lines: AtomicU64,
    pub metrics: AtomicU64,
    pub events: AtomicU64,
    pub bad_lines: AtomicU64,
}

pub struct StatsdParser {
    id: usize,
    handler: Arc<dyn PipelineHandler>,
    namespace: Option<String>,
    /// `None` never logs bad lines, they are only counted
    bad_line_limiter: Option<Arc<TokenBucket>>,
    stats: Arc<ParserStats>,
}

impl StatsdParser {
    #[must_use]
    pub fn new(
        id: usize,
        handler: Arc<dyn PipelineHandler>,
        namespace: Option<String>,
        bad_line_limiter: Option<Arc<TokenBucket>>,
        stats: Arc<ParserStats>,
    ) -> Self {
        Self {
            id,
            handler,
            namespace,
            bad_line_limiter,
            stats,
        }
    }

    /// Consumes batches until cancelled or until every receiver is gone.
    pub async fn run(self, queue: DatagramQueue, cancel: CancellationToken) {
        debug!(parser = self.id, "statsd parser started");
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                batch = async { queue.lock().await.recv().await } => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            self.consume(batch).await;
        }
        debug!(parser = self.id, "statsd parser stopped");
    }

    /// Parses a batch of datagrams and forwards what it found: metrics as
    /// one batch, events one by one.
    pub async fn consume(&self, batch: Vec<Datagram>) {
        let mut metrics = Vec::new();
        let mut events = Vec::new();
        for datagram in batch {
            self.parse_datagram(&datagram, &mut metrics, &mut events);
        }

        if !metrics.is_empty() {
            self.handler.dispatch_metrics(metrics).await;
        }
        for event in events {
            self.handler.dispatch_event(event).await;
        }
    }

    fn parse_datagram(
        &self,
        datagram: &Datagram,
        metrics: &mut Vec<Metric>,
        events: &mut Vec<Event>,
    ) {
        let namespace = self.namespace.as_deref();
        for line in datagram.payload.split(|b| *b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            self.stats.lines.fetch_add(1, Ordering::Relaxed);

            match parse_line(line, namespace) {
                Ok(Parsed::Metric(mut metric)) => {
                    metric.source_ip = Some(datagram.source);
                    self.stats.metrics.fetch_add(1, Ordering::Relaxed);
                    metrics.push(metric);
                }
                Ok(Parsed::Event(mut event)) => {
                    event.source_ip = Some(datagram.source);
                    if event.date_happened == 0 {
                        event.date_happened = unix_now();
                    }
                    self.stats.events.fetch_add(1, Ordering::Relaxed);
                    events.push(event);
                }
                Err(e) => self.bad_line(line, datagram.source, &e),
            }
        }
    }

    fn bad_line(&self, line: &[u8], source: IpAddr, error: &ParseError) {
        self.stats.bad_lines.fetch_add(1, Ordering::Relaxed);
        let Some(limiter) = &self.bad_line_limiter else {
            return;
        };
        if limiter.try_acquire() {
            warn!(
                source = %source,
                "Failed to parse line {:?}: {}",
                String::from_utf8_lossy(line),
                error
            );
        } else {
            trace!(source = %source, "Bad line not logged: {}", error);
        }
    }
}
