// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8125";

// Max buffer size mirrors the common statsd client default of 8KB per datagram
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 8192;
pub const DEFAULT_RECEIVE_BATCH_SIZE: usize = 32;
pub const DEFAULT_RECEIVERS: usize = 2;
pub const DEFAULT_PARSERS: usize = 2;
pub const DEFAULT_WORKERS: usize = 4;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_EXPIRY_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_PERCENT_THRESHOLDS: [f64; 1] = [90.0];

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CACHE_NEGATIVE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_CACHE_REFRESH_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_CACHE_EVICT_AFTER_IDLE: Duration = Duration::from_secs(10 * 60);

pub const DEFAULT_CLOUD_RATE_LIMIT: f64 = 10.0;
pub const DEFAULT_CLOUD_MAX_CONCURRENT: usize = 8;
/// How long the lookup dispatcher waits for more addresses before issuing a
/// partially filled batch.
pub const LOOKUP_BATCH_WINDOW: Duration = Duration::from_millis(10);

pub const DEFAULT_BAD_LINES_PER_MINUTE: f64 = 60.0;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// Queue depths between stages, in messages (batches, not metrics)
pub const DATAGRAM_QUEUE_SIZE: usize = 1_024;
pub const WORKER_QUEUE_SIZE: usize = 1_024;
pub const CACHE_QUEUE_SIZE: usize = 4_096;

/// Pooled buffers kept per receiver, on top of the in-flight batch.
pub const BUFFERS_PER_RECEIVER: usize = 256;

pub const INTERNAL_METRIC_PREFIX: &str = "statsd";
