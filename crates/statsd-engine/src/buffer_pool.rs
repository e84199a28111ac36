// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pool of reusable datagram buffers.
//!
//! A checked-out buffer is a move-only [`PooledBuffer`]; dropping it is the
//! release callback and returns the storage to the pool. Since the handle is
//! consumed on release, a released buffer can never be read again.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

#[derive(Debug, Default)]
pub struct BufferPoolMetrics {
    /// Checkouts served from the pool
    pub hits: AtomicU64,
    /// Checkouts that had to allocate
    pub misses: AtomicU64,
    /// Buffers returned to the pool
    pub returns: AtomicU64,
    /// Buffers dropped because the pool was full
    pub drops: AtomicU64,
}

pub struct BufferPool {
    queue: ArrayQueue<BytesMut>,
    buffer_capacity: usize,
    metrics: BufferPoolMetrics,
}

impl BufferPool {
    /// Pre-allocates `pool_size` buffers of `buffer_capacity` bytes each.
    #[must_use]
    pub fn new(pool_size: usize, buffer_capacity: usize) -> Arc<Self> {
        let queue = ArrayQueue::new(pool_size.max(1));
        for _ in 0..pool_size {
            let _ = queue.push(BytesMut::with_capacity(buffer_capacity));
        }
        Arc::new(Self {
            queue,
            buffer_capacity,
            metrics: BufferPoolMetrics::default(),
        })
    }

    /// Takes a zeroed buffer of `buffer_capacity` bytes, allocating if the
    /// pool is empty.
    #[must_use]
    pub fn checkout(self: &Arc<Self>) -> PooledBuffer {
        let mut buf = match self.queue.pop() {
            Some(buf) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.buffer_capacity)
            }
        };
        buf.clear();
        buf.resize(self.buffer_capacity, 0);
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, buf: BytesMut) {
        if self.queue.push(buf).is_ok() {
            self.metrics.returns.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn metrics(&self) -> &BufferPoolMetrics {
        &self.metrics
    }
}

/// A checked-out buffer. Returned to its pool on drop.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Writable view of the whole buffer, for socket reads.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }

    /// Shrinks the readable region to the `len` bytes actually received.
    pub fn truncate(&mut self, len: usize) {
        if let Some(buf) = self.buf.as_mut() {
            buf.truncate(len);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
