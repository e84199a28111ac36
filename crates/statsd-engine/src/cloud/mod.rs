// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Enrichment of metrics and events with metadata from a cloud inventory.
//!
//! [`handler::CloudHandler`] answers from [`cache`] on the hot path. Misses
//! are queued to [`handler::CloudService`], the single task that owns every
//! cache mutation, which coalesces them per source address and asks
//! [`lookup::LookupDispatcher`] to resolve them in rate-limited batches.

pub mod cache;
pub mod handler;
pub mod lookup;

use std::collections::HashMap;
use std::net::IpAddr;

use crate::errors::LookupError;
use crate::metric::Tags;

/// Metadata resolved for one source address.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub id: String,
    pub tags: Tags,
}

/// A cloud inventory (EC2, GCE, Kubernetes, ...). Implementations live
/// outside the engine.
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Largest number of addresses accepted by one [`Self::instance`] call.
    fn max_instances_batch(&self) -> usize;

    /// Resolves a batch of addresses. Addresses missing from the returned
    /// map were not found.
    async fn instance(&self, ips: &[IpAddr]) -> Result<HashMap<IpAddr, Instance>, LookupError>;
}
