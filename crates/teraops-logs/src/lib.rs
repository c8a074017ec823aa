// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # TeraOps Logs
//!
//! Embedded log shipping pipeline for the TeraOps ingestion API.
//!
//! Events handed to a [`LogShipper`] flow through these stages:
//!
//! - [`normalizer`]: canonical severity, timestamp and trace identifiers
//! - [`enrichment`]: host and process metadata
//! - [`redaction`]: secret masking and size limits
//! - [`buffer`]: bounded in-memory FIFO
//! - [`spillover`]: disk-backed overflow, recovered on the next start
//! - [`scheduler`]: batching on a timer, at the high-water mark, or on demand
//! - [`flusher`]: chunked delivery with retry and backoff
//!
//! Producers never block on I/O and never see an error. What happened to
//! their records is visible through [`LogShipper::stats`].

#![deny(clippy::all)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_comparisons)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer;
pub mod config;
pub mod constants;
pub mod enrichment;
pub mod errors;
pub mod flusher;
pub mod logger;
pub mod normalizer;
pub mod record;
pub mod redaction;
pub mod scheduler;
pub mod shipper;
pub mod spillover;
pub mod stats;

pub use config::{DeliveryMode, RetryConfig, ShipperConfig};
pub use errors::{Fault, StartupError};
pub use record::{LogEvent, LogRecord, RawTimestamp, Severity};
pub use scheduler::FlushOutcome;
pub use shipper::{LogShipper, LogSink};
pub use stats::StatsSnapshot;
