// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::metric::{Event, Metric};

/// A stage of the enrichment chain. Every stage is both a metric and an
/// event sink and forwards what it receives to the next stage; the last
/// stage is the dispatcher that feeds the aggregators and the backends.
#[async_trait::async_trait]
pub trait PipelineHandler: Send + Sync {
    async fn dispatch_metrics(&self, metrics: Vec<Metric>);

    async fn dispatch_event(&self, event: Event);
}
