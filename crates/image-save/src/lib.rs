// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fetch-and-persist task dispatch across a durable queue.
//!
//! A [`producer::Producer`] accepts a request for a remote image, wraps it in a
//! [`task::TaskMessage`] together with the trace context of its enqueue span, and publishes it
//! to a durable queue. A [`consumer::Consumer`] pulls one task at a time, resumes the trace with
//! a follows-from span, downloads the image and acknowledges the delivery.
//!
//! ```text
//! caller -> Producer -> TaskQueue ("tasks") -> Consumer -> ResourceFetcher
//!              |                                  |
//!          enqueue span  --- trace carrier --->  amqp_request span (follows-from)
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod consumer;
pub mod fetcher;
pub mod http_utils;
pub mod log_shipper;
pub mod logger;
pub mod producer;
pub mod queue;
pub mod receiver;
pub mod retry;
pub mod task;
pub mod trace;
