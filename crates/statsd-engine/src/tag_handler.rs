// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::IpAddr;
use std::sync::Arc;

use crate::handler::PipelineHandler;
use crate::metric::{Event, Metric, Tags};

/// Fills in a missing hostname from the source address and appends the
/// process-wide default tags.
pub struct TagHandler {
    tags: Tags,
    next: Arc<dyn PipelineHandler>,
}

impl TagHandler {
    #[must_use]
    pub fn new(tags: Tags, next: Arc<dyn PipelineHandler>) -> Self {
        Self { tags, next }
    }

    fn decorate(&self, hostname: &mut String, source_ip: Option<IpAddr>, tags: &mut Tags) {
        if hostname.is_empty() {
            if let Some(ip) = source_ip {
                *hostname = ip.to_string();
            }
        }
        tags.extend_from(&self.tags);
    }
}

#[async_trait::async_trait]
impl PipelineHandler for TagHandler {
    async fn dispatch_metrics(&self, mut metrics: Vec<Metric>) {
        for metric in &mut metrics {
            self.decorate(&mut metric.hostname, metric.source_ip, &mut metric.tags);
        }
        self.next.dispatch_metrics(metrics).await;
    }

    async fn dispatch_event(&self, mut event: Event) {
        self.decorate(&mut event.hostname, event.source_ip, &mut event.tags);
        self.next.dispatch_event(event).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metric::MetricType;
    use std::sync::Mutex;
    use ustr::ustr;

    /// Records everything it receives.
    #[derive(Default)]
    pub(crate) struct CapturingHandler {
        pub metrics: Mutex<Vec<Metric>>,
        pub events: Mutex<Vec<Event>>,
    }

    #[async_trait::async_trait]
    impl PipelineHandler for CapturingHandler {
        async fn dispatch_metrics(&self, metrics: Vec<Metric>) {
            self.metrics.lock().unwrap().extend(metrics);
        }

        async fn dispatch_event(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_hostname_defaults_to_source_ip_and_tags_are_appended() {
        let capture = Arc::new(CapturingHandler::default());
        let handler = TagHandler::new(Tags::parse("env:prod,region:x"), capture.clone());

        let mut from_ip = Metric::new(ustr("a"), MetricType::Counter, 1.0, Tags::parse("k:v"));
        from_ip.source_ip = Some("10.1.2.3".parse().unwrap());
        let mut named = Metric::new(ustr("b"), MetricType::Gauge, 1.0, Tags::new());
        named.hostname = "web-1".to_string();
        named.source_ip = Some("10.1.2.4".parse().unwrap());

        handler.dispatch_metrics(vec![from_ip, named]).await;

        let metrics = capture.metrics.lock().unwrap();
        assert_eq!(metrics[0].hostname, "10.1.2.3");
        assert_eq!(
            metrics[0].tags.iter().collect::<Vec<_>>(),
            vec!["k:v", "env:prod", "region:x"]
        );
        assert_eq!(metrics[1].hostname, "web-1");
        assert_eq!(metrics[1].tags.len(), 2);
    }

    #[tokio::test]
    async fn test_event_is_decorated() {
        let capture = Arc::new(CapturingHandler::default());
        let handler = TagHandler::new(Tags::parse("env:prod"), capture.clone());
        let event = Event {
            title: "deploy".to_string(),
            source_ip: Some("192.168.0.9".parse().unwrap()),
            ..Event::default()
        };
        handler.dispatch_event(event).await;

        let events = capture.events.lock().unwrap();
        assert_eq!(events[0].hostname, "192.168.0.9");
        assert_eq!(events[0].tags.iter().collect::<Vec<_>>(), vec!["env:prod"]);
    }
}
