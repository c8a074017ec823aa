// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the log shipping pipeline.
//!
//! None of these ever reach the producer's logging call: `accept` absorbs
//! every failure. They surface from startup, from the spillover store to the
//! scheduler, and from a single delivery attempt to the flusher.

use reqwest::StatusCode;

/// Fatal faults raised while starting the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("API key was rejected by the ingestion API (HTTP {status}): {reason}")]
    InvalidApiKey { status: StatusCode, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Condition that stops delivery until the application intervenes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("Delivery suspended: API key rejected (HTTP {status})")]
    Unauthorized { status: StatusCode },
}

/// Failures of the disk-backed spillover store.
#[derive(Debug, thiserror::Error)]
pub enum SpilloverError {
    #[error("Spillover I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode record for spillover: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Spillover directory {0} is not writable")]
    Unwritable(String),

    #[error("Spillover directory {0} is locked by another store")]
    Locked(String),

    #[error("A spillover batch is already in flight")]
    PeekInFlight,
}

/// Failure of a single HTTP request to the ingestion API.
#[derive(Debug, thiserror::Error)]
pub enum ShippingError {
    /// The endpoint answered with a non-success status.
    #[error("Ingestion API responded with HTTP {0}: {1}")]
    Destination(StatusCode, String),

    /// The request never got an answer: connect failure, reset, timeout.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The payload could not be built. Retrying will not help.
    #[error("Failed to prepare payload: {0}")]
    Payload(String),
}

impl ShippingError {
    /// Authentication failures suspend delivery until the key is replaced.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::Destination(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _)
        )
    }

    /// Server errors and transport failures are eligible for retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Destination(status, _) => status.is_server_error(),
            Self::Transport(_) => true,
            Self::Payload(_) => false,
        }
    }
}
