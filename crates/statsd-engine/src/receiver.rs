// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP datagram receiver.
//!
//! Each receiver waits for its socket to become readable and then drains up
//! to `batch_size` datagrams without blocking, one pooled buffer per
//! datagram. Datagrams longer than the configured maximum are counted and
//! dropped rather than truncated. Batches are pushed onto the bounded parser
//! queue. Several
//! receivers may share a socket, or each may own one bound with
//! `SO_REUSEPORT` so the kernel spreads datagrams across them.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::errors::ServerError;
use crate::rate_limit::TokenBucket;

const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// One received datagram. Dropping it returns its buffer to the pool.
#[derive(Debug)]
pub struct Datagram {
    pub source: IpAddr,
    pub payload: PooledBuffer,
}

#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub datagrams: AtomicU64,
    pub batches: AtomicU64,
    pub read_errors: AtomicU64,
    pub oversized: AtomicU64,
}

impl ReceiverStats {
    fn record_batch(&self, size: usize) {
        self.datagrams.fetch_add(size as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }
}

/// Binds the sockets for one listen address: `readers` sockets with
/// `SO_REUSEPORT` when `reuse_port` is set, otherwise a single socket shared
/// by every reader. Port 0 is resolved once so every reader ends up on the
/// same port.
pub fn bind_sockets(
    addr: &str,
    readers: usize,
    reuse_port: bool,
) -> Result<Vec<Arc<UdpSocket>>, ServerError> {
    let requested: SocketAddr = addr
        .trim()
        .parse()
        .map_err(|_| ServerError::InvalidAddress(addr.to_string()))?;
    let bind_error = |source: std::io::Error| ServerError::Bind {
        addr: addr.to_string(),
        source,
    };

    let first = Arc::new(create_socket(requested, reuse_port).map_err(bind_error)?);
    if !reuse_port {
        return Ok(vec![first; readers.max(1)]);
    }

    let resolved = first.local_addr().map_err(bind_error)?;
    let mut sockets = Vec::with_capacity(readers);
    sockets.push(first);
    for _ in 1..readers {
        sockets.push(Arc::new(create_socket(resolved, true).map_err(bind_error)?));
    }
    Ok(sockets)
}

fn create_socket(addr: SocketAddr, reuse_port: bool) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

pub struct DatagramReceiver {
    id: usize,
    socket: Arc<UdpSocket>,
    pool: Arc<BufferPool>,
    batch_size: usize,
    max_datagram_size: usize,
    stats: Arc<ReceiverStats>,
    output: mpsc::Sender<Vec<Datagram>>,
    /// `None` never logs dropped oversized datagrams
    oversize_limiter: Option<Arc<TokenBucket>>,
}

impl DatagramReceiver {
    /// Pool buffers must hold at least `max_datagram_size + 1` bytes so an
    /// oversized datagram can be told apart from one that fits exactly.
    #[must_use]
    pub fn new(
        id: usize,
        socket: Arc<UdpSocket>,
        pool: Arc<BufferPool>,
        batch_size: usize,
        max_datagram_size: usize,
        stats: Arc<ReceiverStats>,
        output: mpsc::Sender<Vec<Datagram>>,
    ) -> Self {
        Self {
            id,
            socket,
            pool,
            batch_size: batch_size.max(1),
            max_datagram_size,
            stats,
            output,
            oversize_limiter: None,
        }
    }

    #[must_use]
    pub fn with_oversize_limiter(mut self, limiter: Option<Arc<TokenBucket>>) -> Self {
        self.oversize_limiter = limiter;
        self
    }

    /// Reads until cancelled or until the parser queue closes.
    pub async fn run(self, cancel: CancellationToken) {
        debug!(receiver = self.id, "datagram receiver started");
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                batch = self.read_batch() => batch,
            };
            self.stats.record_batch(batch.len());

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = self.output.send(batch) => sent,
            };
            if sent.is_err() {
                debug!(receiver = self.id, "parser queue closed");
                break;
            }
        }
        debug!(receiver = self.id, "datagram receiver stopped");
    }

    /// Returns a non-empty batch of at most `batch_size` datagrams.
    async fn read_batch(&self) -> Vec<Datagram> {
        loop {
            if let Err(e) = self.socket.readable().await {
                self.read_failed(&e).await;
                continue;
            }

            let mut batch = Vec::with_capacity(self.batch_size);
            while batch.len() < self.batch_size {
                let mut payload = self.pool.checkout();
                let buf = payload.as_mut_slice();
                let limit = self.max_datagram_size.min(buf.len().saturating_sub(1));
                match self.socket.try_recv_from(buf) {
                    Ok((len, src)) if len > limit => self.oversized(src.ip(), limit),
                    Ok((len, src)) => {
                        payload.truncate(len);
                        batch.push(Datagram {
                            source: src.ip(),
                            payload,
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        self.read_failed(&e).await;
                        break;
                    }
                }
            }
            if !batch.is_empty() {
                return batch;
            }
        }
    }

    fn oversized(&self, source: IpAddr, limit: usize) {
        self.stats.oversized.fetch_add(1, Ordering::Relaxed);
        let Some(limiter) = &self.oversize_limiter else {
            return;
        };
        if limiter.try_acquire() {
            warn!(
                receiver = self.id,
                source = %source,
                "Dropped datagram larger than {} bytes",
                limit
            );
        }
    }

    async fn read_failed(&self, e: &std::io::Error) {
        self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
        warn!(receiver = self.id, error = %e, "error reading from socket");
        tokio::time::sleep(READ_ERROR_BACKOFF).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_receiver_batches_datagrams() {
        let sockets = bind_sockets("127.0.0.1:0", 1, false).unwrap();
        let server_addr = sockets[0].local_addr().unwrap();
        let pool = BufferPool::new(8, 512);
        let stats = Arc::new(ReceiverStats::default());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let receiver = DatagramReceiver::new(
            0,
            Arc::clone(&sockets[0]),
            Arc::clone(&pool),
            16,
            511,
            Arc::clone(&stats),
            tx,
        );
        let task = tokio::spawn(receiver.run(cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for line in ["a:1|c", "b:2|c", "c:3|c"] {
            client.send_to(line.as_bytes(), server_addr).await.unwrap();
        }

        let mut payloads = Vec::new();
        while payloads.len() < 3 {
            let batch = rx.recv().await.unwrap();
            assert!(batch.len() <= 16);
            for datagram in batch {
                assert_eq!(datagram.source, client.local_addr().unwrap().ip());
                payloads.push(String::from_utf8(datagram.payload.to_vec()).unwrap());
            }
        }
        assert_eq!(payloads, vec!["a:1|c", "b:2|c", "c:3|c"]);
        assert_eq!(stats.datagrams.load(Ordering::Relaxed), 3);

        cancel.cancel();
        task.await.unwrap();
        // every buffer has been handed back
        assert_eq!(pool.available(), 8);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_oversized_datagrams_are_dropped_whole() {
        let sockets = bind_sockets("127.0.0.1:0", 1, false).unwrap();
        let server_addr = sockets[0].local_addr().unwrap();
        let pool = BufferPool::new(4, 17);
        let stats = Arc::new(ReceiverStats::default());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let receiver = DatagramReceiver::new(
            0,
            Arc::clone(&sockets[0]),
            Arc::clone(&pool),
            16,
            16,
            Arc::clone(&stats),
            tx,
        )
        .with_oversize_limiter(Some(Arc::new(TokenBucket::new(1.0, 1))));
        let task = tokio::spawn(receiver.run(cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for line in ["a:1|c|#env:production", "b:2|c", "exactly:16|c|#ab"] {
            client.send_to(line.as_bytes(), server_addr).await.unwrap();
        }

        let mut payloads = Vec::new();
        while payloads.len() < 2 {
            for datagram in rx.recv().await.unwrap() {
                payloads.push(String::from_utf8(datagram.payload.to_vec()).unwrap());
            }
        }
        assert_eq!(payloads, vec!["b:2|c", "exactly:16|c|#ab"]);
        assert_eq!(stats.oversized.load(Ordering::Relaxed), 1);
        assert_eq!(stats.datagrams.load(Ordering::Relaxed), 2);
        assert!(logs_contain("Dropped datagram larger than 16 bytes"));

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn test_reuse_port_sockets_share_a_port() {
        let sockets = bind_sockets("127.0.0.1:0", 3, true).unwrap();
        let port = sockets[0].local_addr().unwrap().port();
        assert!(sockets
            .iter()
            .all(|s| s.local_addr().unwrap().port() == port));
    }

    #[tokio::test]
    async fn test_invalid_address() {
        assert!(matches!(
            bind_sockets("not-an-address", 1, false),
            Err(ServerError::InvalidAddress(_))
        ));
    }
}
