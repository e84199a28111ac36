// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batches address lookups and issues them to the provider under a rate
//! limit and a concurrency bound.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::cache::{CacheStats, LookupOutcome};
use super::{CloudProvider, Instance};
use crate::errors::LookupError;
use crate::rate_limit::TokenBucket;

#[derive(Clone, Debug, PartialEq)]
pub struct LookupResult {
    pub ip: IpAddr,
    pub outcome: LookupOutcome,
}

pub struct LookupDispatcher {
    provider: Arc<dyn CloudProvider>,
    /// `None` leaves provider calls unthrottled
    limiter: Option<Arc<TokenBucket>>,
    max_concurrent: usize,
    batch_window: Duration,
    stats: Arc<CacheStats>,
}

impl LookupDispatcher {
    #[must_use]
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        limiter: Option<Arc<TokenBucket>>,
        max_concurrent: usize,
        batch_window: Duration,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            provider,
            limiter,
            max_concurrent: max_concurrent.max(1),
            batch_window,
            stats,
        }
    }

    /// Collects requested addresses for up to `batch_window` (or until a
    /// provider-sized batch is full) and resolves each batch on its own task.
    /// Callers are expected to send each address at most once while it is in
    /// flight.
    pub async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<IpAddr>,
        results: mpsc::UnboundedSender<Vec<LookupResult>>,
        cancel: CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let tracker = TaskTracker::new();
        let max_batch = self.provider.max_instances_batch().max(1);

        loop {
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                ip = requests.recv() => match ip {
                    Some(ip) => ip,
                    None => break,
                },
            };

            let mut batch = vec![first];
            let window = tokio::time::sleep(self.batch_window);
            tokio::pin!(window);
            while batch.len() < max_batch {
                tokio::select! {
                    biased;
                    () = &mut window => break,
                    ip = requests.recv() => match ip {
                        Some(ip) => batch.push(ip),
                        None => break,
                    },
                }
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tracker.spawn(lookup_batch(
                Arc::clone(&self.provider),
                self.limiter.clone(),
                Arc::clone(&self.stats),
                batch,
                results.clone(),
                permit,
                cancel.clone(),
            ));
        }

        tracker.close();
        tracker.wait().await;
        debug!("cloud lookup dispatcher stopped");
    }
}

/// Always reports every address of `batch`: cancellation, a provider error
/// or a crashed provider call all mark the batch failed.
async fn lookup_batch(
    provider: Arc<dyn CloudProvider>,
    limiter: Option<Arc<TokenBucket>>,
    stats: Arc<CacheStats>,
    batch: Vec<IpAddr>,
    results: mpsc::UnboundedSender<Vec<LookupResult>>,
    _permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) {
    let mut found = match call_provider(&provider, limiter, &stats, &batch, &cancel).await {
        Some(Ok(found)) => Some(found),
        Some(Err(e)) => {
            stats.lookup_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                provider = provider.name(),
                addresses = batch.len(),
                error = %e,
                "cloud lookup failed"
            );
            None
        }
        None => None,
    };

    let resolved = batch
        .into_iter()
        .map(|ip| LookupResult {
            ip,
            outcome: match &mut found {
                Some(found) => found
                    .remove(&ip)
                    .map_or(LookupOutcome::NotFound, LookupOutcome::Found),
                None => LookupOutcome::Failed,
            },
        })
        .collect();
    let _ = results.send(resolved);
}

/// `None` when cancelled before the provider answered.
async fn call_provider(
    provider: &Arc<dyn CloudProvider>,
    limiter: Option<Arc<TokenBucket>>,
    stats: &CacheStats,
    batch: &[IpAddr],
    cancel: &CancellationToken,
) -> Option<Result<HashMap<IpAddr, Instance>, LookupError>> {
    if let Some(limiter) = limiter {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            () = limiter.acquire() => {}
        }
    }

    stats.lookups.fetch_add(1, Ordering::Relaxed);
    let mut call = {
        let provider = Arc::clone(provider);
        let ips = batch.to_vec();
        tokio::spawn(async move { provider.instance(&ips).await })
    };
    let joined = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            call.abort();
            return None;
        }
        joined = &mut call => joined,
    };
    Some(joined.unwrap_or_else(|e| Err(LookupError(format!("provider call failed: {e}")))))
}
