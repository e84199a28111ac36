// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::error;

/// Validates a metric namespace prefix.
///
/// The trimmed value must start with an ASCII letter and continue with ASCII
/// alphanumerics, `_` or `.`. Anything else is logged and ignored.
///
/// ```
/// use statsd_engine::util::parse_metric_namespace;
///
/// assert_eq!(parse_metric_namespace(" app.web "), Some("app.web".to_string()));
/// assert_eq!(parse_metric_namespace("9lives"), None);
/// assert_eq!(parse_metric_namespace("my-app"), None);
/// ```
#[must_use]
pub fn parse_metric_namespace(namespace: &str) -> Option<String> {
    let trimmed = namespace.trim();
    let mut chars = trimmed.chars();

    match chars.next() {
        None => return None,
        Some(first) if !first.is_ascii_alphabetic() => {
            error!(
                "STATSD_NAMESPACE must start with a letter, got: '{}'. Ignoring namespace.",
                trimmed
            );
            return None;
        }
        Some(_) => {}
    }

    if let Some(invalid) = chars.find(|&ch| !ch.is_ascii_alphanumeric() && ch != '_' && ch != '.')
    {
        error!(
            "STATSD_NAMESPACE contains invalid character '{}' in '{}'. Ignoring namespace.",
            invalid, trimmed
        );
        return None;
    }

    Some(trimmed.to_string())
}

/// Current wall-clock time in unix seconds.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
