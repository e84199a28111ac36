// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations for flushed snapshots and events.
//!
//! Real transports (Graphite, Datadog, ...) live outside the engine and
//! implement [`Backend`]. Two are provided: [`ConsoleBackend`] writes JSON
//! lines, [`NullBackend`] discards everything.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::error;

use crate::aggregator::AggregatedMetrics;
use crate::errors::BackendError;
use crate::metric::Event;

/// One aggregation worker's finalized window.
#[derive(Debug)]
pub struct Snapshot {
    pub worker: usize,
    /// Unix seconds at flush time
    pub timestamp: i64,
    pub interval: Duration,
    pub metrics: Arc<AggregatedMetrics>,
}

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Delivers a snapshot. Every failure is reported; none stops other
    /// backends.
    async fn send_metrics(&self, snapshot: Arc<Snapshot>) -> Result<(), Vec<BackendError>>;

    async fn send_event(&self, event: &Event) -> Result<(), BackendError>;
}

pub struct NullBackend;

#[async_trait::async_trait]
impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    async fn send_metrics(&self, _snapshot: Arc<Snapshot>) -> Result<(), Vec<BackendError>> {
        Ok(())
    }

    async fn send_event(&self, _event: &Event) -> Result<(), BackendError> {
        Ok(())
    }
}

#[derive(Serialize)]
struct Line<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "is_blank")]
    name: &'a str,
    timestamp: i64,
    #[serde(flatten)]
    data: &'a T,
}

fn is_blank(name: &&str) -> bool {
    name.is_empty()
}

/// Writes one JSON object per accumulator and per event.
pub struct ConsoleBackend<W = tokio::io::Stdout> {
    writer: Mutex<W>,
}

impl ConsoleBackend {
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> ConsoleBackend<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn render(snapshot: &Snapshot) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        let timestamp = snapshot.timestamp;
        let metrics = &snapshot.metrics;

        fn push<T: Serialize>(
            out: &mut String,
            kind: &'static str,
            name: &str,
            timestamp: i64,
            data: &T,
        ) -> Result<(), serde_json::Error> {
            out.push_str(&serde_json::to_string(&Line {
                kind,
                name,
                timestamp,
                data,
            })?);
            out.push('\n');
            Ok(())
        }

        for (name, tagged) in &metrics.counters {
            for counter in tagged.values() {
                push(&mut out, "counter", name, timestamp, counter)?;
            }
        }
        for (name, tagged) in &metrics.gauges {
            for gauge in tagged.values() {
                push(&mut out, "gauge", name, timestamp, gauge)?;
            }
        }
        for (name, tagged) in &metrics.timers {
            for timer in tagged.values() {
                push(&mut out, "timer", name, timestamp, timer)?;
            }
        }
        for (name, tagged) in &metrics.sets {
            for set in tagged.values() {
                push(&mut out, "set", name, timestamp, set)?;
            }
        }
        Ok(out)
    }

    async fn write(&self, text: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(text.as_bytes()).await?;
        writer.flush().await
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> Backend for ConsoleBackend<W> {
    fn name(&self) -> &str {
        "console"
    }

    async fn send_metrics(&self, snapshot: Arc<Snapshot>) -> Result<(), Vec<BackendError>> {
        let text = Self::render(&snapshot)
            .map_err(|e| vec![BackendError::new(self.name(), e.to_string())])?;
        self.write(&text)
            .await
            .map_err(|e| vec![BackendError::new(self.name(), e.to_string())])
    }

    async fn send_event(&self, event: &Event) -> Result<(), BackendError> {
        let mut text = serde_json::to_string(&Line {
            kind: "event",
            name: "",
            timestamp: event.date_happened,
            data: event,
        })
        .map_err(|e| BackendError::new(self.name(), e.to_string()))?;
        text.push('\n');
        self.write(&text)
            .await
            .map_err(|e| BackendError::new(self.name(), e.to_string()))
    }
}

/// Builds the built-in backends by name. Unknown names are skipped with an
/// error log; configuration validation rejects them earlier.
#[must_use]
pub fn from_names(names: &[String]) -> Vec<Arc<dyn Backend>> {
    let mut backends: Vec<Arc<dyn Backend>> = Vec::with_capacity(names.len());
    for name in names {
        match name.as_str() {
            "console" => backends.push(Arc::new(ConsoleBackend::stdout())),
            "null" => backends.push(Arc::new(NullBackend)),
            unknown => error!("Unknown backend '{unknown}', skipping"),
        }
    }
    backends
}
