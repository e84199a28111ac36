// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric and event values produced by the wire parser and consumed by the
//! enrichment chain and the aggregators.

use std::net::IpAddr;

use derive_more::Display;
use serde::Serialize;
use ustr::Ustr;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum MetricType {
    #[display("counter")]
    Counter,
    #[display("gauge")]
    Gauge,
    #[display("timer")]
    Timer,
    #[display("set")]
    Set,
}

/// Ordered list of `key:value` or bare tags, as they arrived on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Tags(Vec<String>);

impl Tags {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Splits a comma-separated tag section, skipping empty segments.
    #[must_use]
    pub fn parse(section: &str) -> Self {
        Self(
            section
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn push(&mut self, tag: impl Into<String>) {
        self.0.push(tag.into());
    }

    pub fn extend_from(&mut self, other: &Tags) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical aggregation sub-key: sorted tags joined by `,`, followed by
    /// `,s:<hostname>` when a hostname is known.
    #[must_use]
    pub fn key(&self, hostname: &str) -> String {
        let mut sorted: Vec<&str> = self.iter().collect();
        sorted.sort_unstable();
        let mut key = sorted.join(",");
        if !hostname.is_empty() {
            key.push_str(",s:");
            key.push_str(hostname);
        }
        key
    }
}

impl From<Vec<String>> for Tags {
    fn from(tags: Vec<String>) -> Self {
        Self(tags)
    }
}

impl<S: Into<String>> FromIterator<S> for Tags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    pub name: Ustr,
    pub value: f64,
    /// Raw value for sets, which aggregate unique strings rather than numbers.
    pub string_value: String,
    pub metric_type: MetricType,
    pub tags: Tags,
    pub hostname: String,
    pub source_ip: Option<IpAddr>,
    tags_key: Option<String>,
}

impl Metric {
    #[must_use]
    pub fn new(name: Ustr, metric_type: MetricType, value: f64, tags: Tags) -> Self {
        Self {
            name,
            value,
            string_value: String::new(),
            metric_type,
            tags,
            hostname: String::new(),
            source_ip: None,
            tags_key: None,
        }
    }

    #[must_use]
    pub fn new_set(name: Ustr, member: String, tags: Tags) -> Self {
        Self {
            string_value: member,
            ..Self::new(name, MetricType::Set, 0.0, tags)
        }
    }

    /// The tags-key for this metric. Computed on first call and never
    /// recomputed, so enrichment must be complete before the first call.
    pub fn tags_key(&mut self) -> &str {
        let Self {
            tags,
            hostname,
            tags_key,
            ..
        } = self;
        tags_key.get_or_insert_with(|| tags.key(hostname))
    }
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    #[display("normal")]
    Normal,
    #[display("low")]
    Low,
}

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    #[default]
    #[display("info")]
    Info,
    #[display("error")]
    Error,
    #[display("warning")]
    Warning,
    #[display("success")]
    Success,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Event {
    pub title: String,
    pub text: String,
    /// Unix seconds. Zero until the parser stage stamps it.
    pub date_happened: i64,
    pub hostname: String,
    pub aggregation_key: String,
    pub source_type_name: String,
    pub tags: Tags,
    pub source_ip: Option<IpAddr>,
    pub priority: Priority,
    pub alert_type: AlertType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ustr::ustr;

    #[test]
    fn test_tags_parse_skips_empty_segments() {
        let tags = Tags::parse(",env:prod,,service:web,");
        assert_eq!(tags.iter().collect::<Vec<_>>(), vec!["env:prod", "service:web"]);
    }

    #[test]
    fn test_tags_key_is_sorted_and_includes_hostname() {
        let tags: Tags = ["z:1", "a:2", "bare"].into_iter().collect();
        assert_eq!(tags.key(""), "a:2,bare,z:1");
        assert_eq!(tags.key("10.0.0.1"), "a:2,bare,z:1,s:10.0.0.1");
        assert_eq!(Tags::new().key("h"), ",s:h");
    }

    #[test]
    fn test_tags_key_does_not_change_after_first_use() {
        let mut metric = Metric::new(ustr("m"), MetricType::Counter, 1.0, Tags::parse("b,a"));
        assert_eq!(metric.tags_key(), "a,b");
        metric.tags.push("c");
        metric.hostname = "late".to_string();
        assert_eq!(metric.tags_key(), "a,b");
    }

    #[test]
    fn test_display() {
        assert_eq!(MetricType::Timer.to_string(), "timer");
        assert_eq!(AlertType::Warning.to_string(), "warning");
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
