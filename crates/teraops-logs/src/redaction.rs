// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Secret masking and size enforcement.
//!
//! Every record passes through the [`Redactor`] exactly once, after
//! enrichment and before it is buffered. The stage is pure: it holds no
//! cross-record state and only rewrites the message and attribute values.
//!
//! # Rules
//!
//! Each rule is a case-insensitive regex with one capture group holding the
//! key-like prefix (`password=`, `Authorization: Bearer `, ...). The text that
//! follows the prefix is replaced with [`REDACTED`], so the prefix survives
//! and the secret does not.
//!
//! # Limits
//!
//! After masking, the message is clamped to [`MAX_MESSAGE_BYTES`], each
//! attribute value to [`MAX_ATTRIBUTE_VALUE_BYTES`] and the attribute count to
//! [`MAX_ATTRIBUTES`]. Clamping never cuts a secret in a way that would leave
//! part of it exposed, and re-running the stage on its own output is a no-op.

use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::OnceLock;
use tracing::debug;

use crate::constants::{
    MAX_ATTRIBUTES, MAX_ATTRIBUTE_VALUE_BYTES, MAX_MESSAGE_BYTES, REDACTED, TRUNCATION_MARKER,
};
use crate::record::{Attributes, LogRecord};

const REPLACEMENT: &str = "${1}***REDACTED***";

/// Upper bound on masking passes. Rules converge after one or two.
const MAX_PASSES: usize = 4;

/// Attribute names whose values are always masked, whatever they contain.
const SENSITIVE_NAMES: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "secret_key",
    "secretkey",
    "secret-key",
    "api_key",
    "apikey",
    "api-key",
    "access_key",
    "accesskey",
    "access-key",
    "private_key",
    "privatekey",
    "private-key",
    "token",
    "auth_token",
    "access_token",
    "refresh_token",
    "authorization",
    "credential",
    "credentials",
    "connection_string",
    "connectionstring",
    "database_url",
    "db_url",
    "aws_secret_access_key",
    "aws_access_key_id",
    "ssn",
    "social_security",
    "credit_card",
    "card_number",
    "cvv",
];

/// (name, pattern) pairs, applied in order.
const RULE_PATTERNS: &[(&str, &str)] = &[
    ("password", r#"(?i)(password\s*[=:]\s*)[^\s,;"'}\]]+"#),
    ("api_key", r#"(?i)(api[_-]?key\s*[=:]\s*)[^\s,;"'}\]]+"#),
    ("secret_key", r#"(?i)(secret[_-]?key\s*[=:]\s*)[^\s,;"'}\]]+"#),
    ("access_key", r#"(?i)(access[_-]?key\s*[=:]\s*)[^\s,;"'}\]]+"#),
    ("token", r#"(?i)((?:auth[_-]?)?token\s*[=:]\s*)[^\s,;"'}\]]+"#),
    (
        "authorization",
        r#"(?i)(authorization\s*[=:]\s*(?:bearer|basic|token)\s+)[^\s,;"'}\]]+"#,
    ),
    ("bearer", r"(?i)(bearer\s+)[A-Za-z0-9_\-.]+"),
    ("aws_key", r#"(?i)(AWS_[A-Z_]*KEY[_ID]*\s*[=:]\s*)[^\s,;"'}\]]+"#),
    ("private_key", r#"(?i)(private[_-]?key\s*[=:]\s*)[^\s,;"'}\]]+"#),
    ("credential", r#"(?i)(credentials?\s*[=:]\s*)[^\s,;"'}\]]+"#),
    (
        "connection_string",
        r#"(?i)(connection[_-]?string\s*[=:]\s*)[^\s,;"'}\]]+"#,
    ),
    ("database_url", r#"(?i)((?:database|db)[_-]?url\s*[=:]\s*)[^\s,;"'}\]]+"#),
    ("ssn", r#"(?i)((?:ssn|social[_-]?security)\s*[=:]\s*)[^\s,;"'}\]]+"#),
    (
        "credit_card",
        r#"(?i)((?:credit[_-]?card|card[_-]?number)\s*[=:]\s*)[^\s,;"'}\]]+"#,
    ),
];

#[allow(clippy::panic)]
fn rules() -> &'static [Regex] {
    static RULES: OnceLock<Vec<Regex>> = OnceLock::new();
    RULES.get_or_init(|| {
        RULE_PATTERNS
            .iter()
            .map(|(name, pattern)| {
                Regex::new(pattern)
                    .unwrap_or_else(|e| panic!("redaction rule {name} is invalid: {e}"))
            })
            .collect()
    })
}

/// Masks every secret-like substring in `text`.
///
/// Returns the input untouched (borrowed) when nothing matched.
#[must_use]
pub fn redact_text(text: &str) -> Cow<'_, str> {
    let mut current = Cow::Borrowed(text);
    for _ in 0..MAX_PASSES {
        let mut changed = false;
        for rule in rules() {
            let replaced = match rule.replace_all(&current, REPLACEMENT) {
                Cow::Borrowed(_) => continue,
                Cow::Owned(replaced) => replaced,
            };
            if replaced != *current {
                current = Cow::Owned(replaced);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    current
}

/// Start offset of the last rule match whose secret part is not the placeholder.
#[must_use]
pub fn last_unredacted_match(text: &str) -> Option<usize> {
    rules()
        .iter()
        .flat_map(|rule| rule.captures_iter(text))
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            let prefix = captures.get(1)?;
            let secret = &text[prefix.end()..whole.end()];
            (secret != REDACTED).then_some(whole.start())
        })
        .max()
}

/// Whether an attribute with this name must never carry its real value.
#[must_use]
pub fn is_sensitive_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    if SENSITIVE_NAMES.contains(&lowered.as_str()) {
        return true;
    }
    // A name that would itself start a key=value secret, e.g. `db_password`.
    let assignment = format!("{lowered}=x");
    rules().iter().any(|rule| rule.is_match(&assignment))
}

/// Cuts `text` to at most `limit` bytes, appending the truncation marker.
///
/// The cut moves back to the start of any secret it would split, so the
/// result is still a fixed point of [`redact_text`].
fn clamp_text(text: Cow<'_, str>, limit: usize) -> (String, bool) {
    if text.len() <= limit {
        return (text.into_owned(), false);
    }
    let mut cut = floor_char_boundary(&text, limit.saturating_sub(TRUNCATION_MARKER.len()));
    loop {
        let candidate = format!("{}{TRUNCATION_MARKER}", &text[..cut]);
        match last_unredacted_match(&candidate) {
            Some(start) if start < cut => cut = floor_char_boundary(&text, start),
            _ => return (candidate, true),
        }
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}

/// Applies masking and size limits to records.
#[derive(Debug, Clone, Copy)]
pub struct Redactor {
    max_message_bytes: usize,
    max_attribute_value_bytes: usize,
    max_attributes: usize,
}

impl Default for Redactor {
    fn default() -> Self {
        Self {
            max_message_bytes: MAX_MESSAGE_BYTES,
            max_attribute_value_bytes: MAX_ATTRIBUTE_VALUE_BYTES,
            max_attributes: MAX_ATTRIBUTES,
        }
    }
}

impl Redactor {
    #[must_use]
    pub fn with_limits(
        max_message_bytes: usize,
        max_attribute_value_bytes: usize,
        max_attributes: usize,
    ) -> Self {
        Self {
            max_message_bytes,
            max_attribute_value_bytes,
            max_attributes,
        }
    }

    /// Masks secrets in the message and attributes, then enforces the limits.
    #[must_use]
    pub fn apply(&self, mut record: LogRecord) -> LogRecord {
        let (message, clamped) = clamp_text(redact_text(&record.message), self.max_message_bytes);
        record.message = message;
        record.truncated |= clamped;
        record.attributes = self.redact_attributes(std::mem::take(&mut record.attributes));
        record
    }

    fn redact_attributes(&self, attributes: Attributes) -> Attributes {
        let total = attributes.len();
        if total > self.max_attributes {
            debug!(
                "LOGS | Dropping {} attributes beyond the limit of {}",
                total - self.max_attributes,
                self.max_attributes
            );
        }
        attributes
            .into_iter()
            .take(self.max_attributes)
            .map(|(key, value)| {
                let value = self.redact_value(Some(&key), value);
                (key, value)
            })
            .collect()
    }

    fn redact_value(&self, name: Option<&str>, value: Value) -> Value {
        if name.is_some_and(is_sensitive_name) {
            return Value::String(REDACTED.to_string());
        }
        let value = match value {
            Value::String(text) => return Value::String(self.clamp_value(redact_text(&text))),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.redact_value(None, item))
                    .collect(),
            ),
            Value::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(key, field)| {
                        let field = self.redact_value(Some(&key), field);
                        (key, field)
                    })
                    .collect(),
            ),
            scalar => return scalar,
        };

        // Oversized structures are flattened to their JSON text and clamped.
        match serde_json::to_string(&value) {
            Ok(encoded) if encoded.len() > self.max_attribute_value_bytes => {
                Value::String(self.clamp_value(redact_text(&encoded)))
            }
            _ => value,
        }
    }

    fn clamp_value(&self, text: Cow<'_, str>) -> String {
        clamp_text(text, self.max_attribute_value_bytes).0
    }
}
