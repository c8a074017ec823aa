// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-level metadata stamped onto every record.
//!
//! The metadata is detected once when the shipper starts and shared through an
//! `Arc`; stamping a record only bumps a reference count.

use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use tracing::warn;

use crate::constants::SDK_VERSION;
use crate::normalizer::NormalizedEvent;
use crate::record::LogRecord;

/// Static description of the process that produced a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub hostname: String,
    pub process_id: u32,
    pub runtime: String,
    pub os: String,
    pub arch: String,
}

impl ResourceMetadata {
    /// Detects the metadata of the current process.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            hostname: get_hostname(),
            process_id: std::process::id(),
            runtime: format!("Rust teraops-logs/{SDK_VERSION}"),
            os: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
        }
    }
}

/// Attaches the shared [`ResourceMetadata`] to normalized events.
#[derive(Debug, Clone)]
pub struct Enricher {
    resource: Arc<ResourceMetadata>,
}

impl Enricher {
    #[must_use]
    pub fn new(resource: ResourceMetadata) -> Self {
        Self {
            resource: Arc::new(resource),
        }
    }

    #[must_use]
    pub fn resource(&self) -> &Arc<ResourceMetadata> {
        &self.resource
    }

    #[must_use]
    pub fn enrich(&self, event: NormalizedEvent) -> LogRecord {
        LogRecord {
            timestamp: event.timestamp,
            severity: event.severity,
            message: event.message,
            truncated: false,
            attributes: event.attributes,
            trace_id: event.trace_id,
            span_id: event.span_id,
            resource: Arc::clone(&self.resource),
            sdk_version: SDK_VERSION.to_string(),
        }
    }
}

/// Get the system hostname
///
/// 1. HOSTNAME environment variable
/// 2. System hostname
/// 3. Fallback to "unknown"
#[must_use]
pub fn get_hostname() -> String {
    if let Ok(hostname) = env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }

    if let Some(hostname) = system_hostname() {
        return hostname;
    }

    warn!("LOGS | Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname
            .to_str()
            .filter(|name| !name.is_empty())
            .map(ToString::to_string),
        Err(e) => {
            warn!("LOGS | Failed to get system hostname: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    env::var("COMPUTERNAME").ok().filter(|name| !name.is_empty())
}
