// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by every stage of the engine.

/// Wire-format errors. Every variant is non-fatal: the offending line is
/// dropped and counted, and processing continues with the next line.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("missing key/value separator ':'")]
    MissingKeySeparator,

    #[error("empty metric key")]
    EmptyKey,

    #[error("missing value/type separator '|'")]
    MissingValueSeparator,

    #[error("unknown metric type: {0:?}")]
    UnknownType(String),

    #[error("invalid metric value: {0:?}")]
    InvalidValue(String),

    #[error("metric value is NaN")]
    NanValue,

    #[error("invalid sample rate: {0:?}")]
    InvalidSampleRate(String),

    #[error("invalid segment: {0:?}")]
    InvalidSegment(String),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("malformed event: {0}")]
    MalformedEvent(&'static str),

    #[error("invalid event length: {0}")]
    InvalidEventLength(String),

    #[error("unknown event attribute '{0}'")]
    UnknownEventAttribute(char),

    #[error("malformed event attribute: {0:?}")]
    MalformedEventAttribute(String),

    #[error("invalid event date: {0:?}")]
    InvalidEventDate(String),
}

/// A cloud provider call failed. The affected addresses are cached as
/// negative entries.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cloud lookup failed: {0}")]
pub struct LookupError(pub String);

/// A backend failed to accept a snapshot or an event.
#[derive(Debug, Clone, thiserror::Error)]
#[error("backend {backend}: {message}")]
pub struct BackendError {
    pub backend: String,
    pub message: String,
}

impl BackendError {
    pub fn new(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

/// An aggregation worker could not be reached.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("aggregation worker {0} is not running")]
    WorkerClosed(usize),

    #[error("aggregation worker {0} dropped the flush response")]
    ResponseDropped(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that prevent the engine from starting.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),
}
