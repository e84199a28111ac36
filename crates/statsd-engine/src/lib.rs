// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod aggregator_service;
pub mod backend;
pub mod buffer_pool;
pub mod cloud;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod errors;
pub mod flusher;
pub mod handler;
pub mod lexer;
pub mod metric;
pub mod rate_limit;
pub mod receiver;
pub mod server;
pub mod stats;
pub mod statsd;
pub mod tag_handler;
pub mod util;
