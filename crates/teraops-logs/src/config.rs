// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::Url;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_SEGMENT_BYTES, DEFAULT_SPILLOVER_BYTES, INGEST_PATH,
    MAX_PAYLOAD_BYTES,
};
use crate::errors::StartupError;

pub const DEFAULT_API_URL: &str = "https://back-poc.teraops.ai";
pub const DEFAULT_LOG_TYPE: &str = "otel";

/// How eagerly buffered records are shipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Ship on the flush interval, or earlier at the high-water mark.
    #[default]
    Batched,
    /// Ship as soon as anything is buffered. Payloads are flagged as live.
    RealTime,
}

/// Bounded exponential backoff for retryable delivery failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per chunk, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based): `base * multiplier^(retry-1)`, capped.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = self.base_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }
}

/// Configuration of the log shipping pipeline.
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// API key sent as a bearer token. Required.
    pub api_key: String,
    /// Base URL of the ingestion API
    pub api_url: String,
    /// Sent in the `X-Log-Type` header
    pub log_type: String,
    pub mode: DeliveryMode,
    /// Install a stderr subscriber for the pipeline's own diagnostics
    pub debug: bool,
    /// Check the API key against the endpoint before accepting records
    pub validate_api_key: bool,
    pub spillover_enabled: bool,
    /// Defaults to `<tmp>/teraops_spillover`
    pub spillover_dir: Option<PathBuf>,
    pub flush_interval: Duration,
    /// Timeout of every HTTP request
    pub request_timeout: Duration,
    /// Capacity of the in-memory buffer, in records
    pub max_buffer_size: usize,
    /// Buffer length that triggers an early flush
    pub high_water_mark: usize,
    pub max_spillover_bytes: u64,
    pub spillover_segment_bytes: u64,
    /// Upper bound of one request body
    pub max_payload_bytes: usize,
    pub retry: RetryConfig,
    /// Budget of the final drain on shutdown
    pub shutdown_timeout: Duration,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_url: DEFAULT_API_URL.to_string(),
            log_type: DEFAULT_LOG_TYPE.to_string(),
            mode: DeliveryMode::Batched,
            debug: false,
            validate_api_key: true,
            spillover_enabled: true,
            spillover_dir: None,
            flush_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            max_buffer_size: DEFAULT_BUFFER_CAPACITY,
            high_water_mark: DEFAULT_BUFFER_CAPACITY / 10 * 8,
            max_spillover_bytes: DEFAULT_SPILLOVER_BYTES,
            spillover_segment_bytes: DEFAULT_SEGMENT_BYTES,
            max_payload_bytes: MAX_PAYLOAD_BYTES,
            retry: RetryConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
            https_proxy: None,
        }
    }
}

impl ShipperConfig {
    /// Default configuration for the given API key.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Full URL of the ingestion endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}{INGEST_PATH}", self.api_url.trim_end_matches('/'))
    }

    #[must_use]
    pub fn spillover_dir(&self) -> PathBuf {
        self.spillover_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("teraops_spillover"))
    }

    /// Buffer length that wakes the scheduler, after applying the delivery mode.
    #[must_use]
    pub fn effective_high_water_mark(&self) -> usize {
        match self.mode {
            DeliveryMode::Batched => self.high_water_mark,
            DeliveryMode::RealTime => 1,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.api_key.trim().is_empty() {
            return Err(StartupError::InvalidConfig(
                "api_key cannot be empty".to_string(),
            ));
        }

        match Url::parse(&self.api_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(StartupError::InvalidConfig(format!(
                    "api_url must use http or https, got '{}'",
                    url.scheme()
                )))
            }
            Err(e) => {
                return Err(StartupError::InvalidConfig(format!(
                    "Invalid api_url '{}': {}",
                    self.api_url, e
                )))
            }
        }

        if self.log_type.trim().is_empty() {
            return Err(StartupError::InvalidConfig(
                "log_type cannot be empty".to_string(),
            ));
        }

        if self.max_buffer_size == 0 {
            return Err(StartupError::InvalidConfig(
                "max_buffer_size must be greater than 0".to_string(),
            ));
        }

        if self.high_water_mark == 0 || self.high_water_mark > self.max_buffer_size {
            return Err(StartupError::InvalidConfig(format!(
                "high_water_mark must be between 1 and max_buffer_size ({})",
                self.max_buffer_size
            )));
        }

        if self.flush_interval.is_zero() || self.request_timeout.is_zero() {
            return Err(StartupError::InvalidConfig(
                "flush_interval and request_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_payload_bytes == 0 {
            return Err(StartupError::InvalidConfig(
                "max_payload_bytes must be greater than 0".to_string(),
            ));
        }

        if self.spillover_enabled {
            if self.max_spillover_bytes == 0 || self.spillover_segment_bytes == 0 {
                return Err(StartupError::InvalidConfig(
                    "spillover sizes must be greater than 0".to_string(),
                ));
            }
            if self.spillover_segment_bytes > self.max_spillover_bytes
                || self.spillover_segment_bytes > self.max_payload_bytes as u64
            {
                return Err(StartupError::InvalidConfig(format!(
                    "spillover_segment_bytes ({}) cannot exceed max_spillover_bytes ({}) or max_payload_bytes ({})",
                    self.spillover_segment_bytes, self.max_spillover_bytes, self.max_payload_bytes
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(StartupError::InvalidConfig(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if let Some(proxy) = &self.https_proxy {
            if let Err(e) = Url::parse(proxy) {
                return Err(StartupError::InvalidConfig(format!(
                    "Invalid https_proxy '{proxy}': {e}"
                )));
            }
        }

        Ok(())
    }
}
