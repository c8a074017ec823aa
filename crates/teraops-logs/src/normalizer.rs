// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! First pipeline stage: coerce a loosely typed [`LogEvent`] into canonical form.
//!
//! Normalization never fails loudly. Unknown severities become `INFO`,
//! unparseable timestamps become "now", malformed trace identifiers are
//! discarded. Only an event with neither message nor attributes is rejected.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::record::{Attributes, LogEvent, RawTimestamp, Severity};

/// Attribute that may carry the event timestamp when the event itself has none.
const TIMESTAMP_ATTRIBUTE: &str = "timestamp";

/// An event with canonical severity and timestamp, not yet enriched.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub attributes: Attributes,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

/// Normalizes an event, or returns `None` when there is nothing to ship.
#[must_use]
pub fn normalize(event: LogEvent) -> Option<NormalizedEvent> {
    let LogEvent {
        timestamp,
        severity_text,
        severity_number,
        message,
        mut attributes,
        trace_id,
        span_id,
    } = event;

    // The attribute is consumed even when the event already has a timestamp.
    let attribute_timestamp = attributes
        .shift_remove(TIMESTAMP_ATTRIBUTE)
        .and_then(timestamp_from_value);
    let timestamp = timestamp.or(attribute_timestamp);

    let message = message.unwrap_or_default();
    if message.trim().is_empty() && attributes.is_empty() {
        return None;
    }

    let severity = match (severity_text, severity_number) {
        (Some(text), _) if !text.trim().is_empty() => Severity::parse(&text),
        (_, Some(number)) => Severity::from_number(number),
        _ => Severity::Info,
    };

    Some(NormalizedEvent {
        timestamp: normalize_timestamp(timestamp),
        severity,
        message,
        attributes,
        trace_id: trace_id.and_then(normalize_trace_identifier),
        span_id: span_id.and_then(normalize_trace_identifier),
    })
}

/// Resolves a raw timestamp to millisecond resolution, defaulting to now.
#[must_use]
pub fn normalize_timestamp(raw: Option<RawTimestamp>) -> DateTime<Utc> {
    let resolved = match raw {
        Some(RawTimestamp::DateTime(ts)) => Some(ts),
        Some(RawTimestamp::SystemTime(ts)) => Some(DateTime::<Utc>::from(ts)),
        Some(RawTimestamp::UnixNanos(0)) => None,
        Some(RawTimestamp::UnixNanos(nanos)) => Some(DateTime::from_timestamp_nanos(nanos)),
        Some(RawTimestamp::Text(text)) => parse_timestamp_text(&text),
        None => None,
    };
    let ts = resolved.unwrap_or_else(Utc::now);
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

fn timestamp_from_value(value: Value) -> Option<RawTimestamp> {
    match value {
        Value::String(text) => Some(RawTimestamp::Text(text)),
        Value::Number(number) => {
            if let Some(whole) = number.as_i64() {
                from_epoch_integer(whole).map(RawTimestamp::DateTime)
            } else {
                number
                    .as_f64()
                    .and_then(from_epoch_seconds)
                    .map(RawTimestamp::DateTime)
            }
        }
        _ => None,
    }
}

fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(whole) = text.parse::<i64>() {
        return from_epoch_integer(whole);
    }
    text.parse::<f64>().ok().and_then(from_epoch_seconds)
}

/// Epoch integers are interpreted by magnitude: seconds, millis, micros or nanos.
fn from_epoch_integer(value: i64) -> Option<DateTime<Utc>> {
    match value.unsigned_abs() {
        0 => None,
        v if v < 100_000_000_000 => DateTime::from_timestamp(value, 0),
        v if v < 100_000_000_000_000 => DateTime::from_timestamp_millis(value),
        v if v < 100_000_000_000_000_000 => DateTime::from_timestamp_micros(value),
        _ => Some(DateTime::from_timestamp_nanos(value)),
    }
}

fn from_epoch_seconds(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let millis = (value * 1_000.0) as i64;
    DateTime::from_timestamp_millis(millis)
}

/// Keeps hex identifiers (lowercased); drops empty, all-zero or non-hex ones.
fn normalize_trace_identifier(id: String) -> Option<String> {
    let id = id.trim();
    if id.is_empty()
        || !id.chars().all(|c| c.is_ascii_hexdigit())
        || id.chars().all(|c| c == '0')
    {
        return None;
    }
    Some(id.to_ascii_lowercase())
}
