// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Inbound events and the canonical record shipped to the ingestion API.
//!
//! A [`LogEvent`] is what the host logging framework hands to the sink: every
//! field is optional and loosely typed. A [`LogRecord`] is the normalized,
//! enriched and redacted form that travels through the buffer, the spillover
//! store and finally the wire.

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use crate::enrichment::ResourceMetadata;

/// Ordered attribute map. Insertion order is preserved on the wire.
pub type Attributes = IndexMap<String, Value>;

/// Fixed, ordered severity scale.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    /// Maps free-form severity text onto the scale. Unknown input is `Info`.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Self::Trace,
            "DEBUG" => Self::Debug,
            "INFO" | "INFORMATION" | "NOTICE" => Self::Info,
            "WARN" | "WARNING" => Self::Warn,
            "ERROR" | "ERR" => Self::Error,
            "FATAL" | "CRITICAL" | "CRIT" | "PANIC" => Self::Fatal,
            _ => Self::Info,
        }
    }

    /// Maps an OpenTelemetry severity number (1..=24) onto the scale.
    #[must_use]
    pub fn from_number(number: i32) -> Self {
        match number {
            1..=4 => Self::Trace,
            5..=8 => Self::Debug,
            9..=12 => Self::Info,
            13..=16 => Self::Warn,
            17..=20 => Self::Error,
            21..=24 => Self::Fatal,
            _ => Self::Info,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

/// Timestamp as supplied by the producer, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawTimestamp {
    DateTime(DateTime<Utc>),
    SystemTime(SystemTime),
    /// Nanoseconds since the Unix epoch. Zero means "not set".
    UnixNanos(i64),
    /// RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]`, or a numeric epoch string.
    Text(String),
}

/// One event as observed by the host logging framework.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogEvent {
    pub timestamp: Option<RawTimestamp>,
    pub severity_text: Option<String>,
    pub severity_number: Option<i32>,
    pub message: Option<String>,
    pub attributes: Attributes,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl LogEvent {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity_text = Some(severity.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: RawTimestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_trace_context(
        mut self,
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
    ) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }
}

/// A normalized, enriched and redacted log record.
///
/// Records are immutable once they leave the redaction stage. They are
/// serialized as one JSON object, both on the wire and in spillover segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(with = "canonical_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    pub resource: Arc<ResourceMetadata>,
    pub sdk_version: String,
}

impl LogRecord {
    /// Size of the compact JSON encoding, without allocating it.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let mut counter = ByteCounter(0);
        match serde_json::to_writer(&mut counter, self) {
            Ok(()) => counter.0,
            Err(_) => 0,
        }
    }
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// RFC 3339 in UTC with millisecond resolution and a `Z` suffix.
pub mod canonical_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Formats a timestamp the way it appears on the wire.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
