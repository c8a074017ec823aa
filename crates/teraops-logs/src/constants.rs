// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits enforced by the shipping pipeline.
//!
//! Sizes are measured in bytes of UTF-8 (for text) or of compact JSON (for
//! structured values and whole records).

/// Version reported in the `X-SDK-Version` header and stamped on every record.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Path of the ingestion API, appended to the configured base URL.
pub const INGEST_PATH: &str = "/api/ingestion/ingest";

/// Maximum size of a log message after truncation (64KB).
pub const MAX_MESSAGE_BYTES: usize = 64 * 1_024;

/// Maximum serialized size of a single attribute value (4KB).
pub const MAX_ATTRIBUTE_VALUE_BYTES: usize = 4 * 1_024;

/// Maximum number of attributes kept per record. Earliest entries win.
pub const MAX_ATTRIBUTES: usize = 50;

/// Maximum uncompressed size of one HTTP request body (5MB).
///
/// Batches whose serialized form is larger are split into several chunks,
/// never inside a record.
pub const MAX_PAYLOAD_BYTES: usize = 5 * 1_024 * 1_024;

/// Default capacity of the in-memory buffer, in records.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Default disk budget for spillover segments (100MB).
pub const DEFAULT_SPILLOVER_BYTES: u64 = 100 * 1_024 * 1_024;

/// Default size at which a spillover segment is sealed and a new one opened.
pub const DEFAULT_SEGMENT_BYTES: u64 = 1_024 * 1_024;

/// Maximum number of records drained from the buffer per batch.
pub const MAX_BATCH_RECORDS: usize = 10_000;

/// Placeholder substituted for anything that looks like a secret.
pub const REDACTED: &str = "***REDACTED***";

/// Appended to messages and attribute values that were cut short.
pub const TRUNCATION_MARKER: &str = "...[TRUNCATED]";
