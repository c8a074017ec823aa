// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of batches to the ingestion API.
//!
//! A batch is serialized once, split into chunks that each fit in the
//! payload limit, and every chunk is POSTed as its own request. All chunks of
//! a batch carry the same `batch_id`.
//!
//! | Response            | Handling                                           |
//! |---------------------|----------------------------------------------------|
//! | 2xx                 | chunk acknowledged                                 |
//! | 5xx, network, timeout | retried with exponential backoff, then batch failed |
//! | 401, 403            | batch failed, delivery suspended                   |
//! | other 4xx           | chunk dropped and counted, not retried             |

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{DeliveryMode, RetryConfig, ShipperConfig};
use crate::constants::SDK_VERSION;
use crate::errors::{ShippingError, StartupError};
use crate::record::LogRecord;

/// Space kept free in every chunk for the envelope around the records.
const ENVELOPE_RESERVE: usize = 256;

/// Longest response body kept for diagnostics.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Result of shipping one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipOutcome {
    /// Every chunk was answered. Chunks refused with a 4xx count as `rejected`.
    Delivered { delivered: usize, rejected: usize },
    /// A chunk ran out of retries. Nothing in the batch may be considered sent.
    Failed,
    /// The API key was refused.
    Unauthorized(StatusCode),
}

/// One request body and the number of records inside it.
#[derive(Debug)]
pub struct Chunk {
    pub body: Vec<u8>,
    pub records: usize,
}

/// Builds the HTTP client used for every request.
pub fn build_client(
    https_proxy: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, StartupError> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if let Some(proxy) = https_proxy {
        let proxy = reqwest::Proxy::https(proxy)
            .map_err(|e| StartupError::HttpClient(format!("invalid proxy '{proxy}': {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| StartupError::HttpClient(e.to_string()))
}

#[derive(Debug)]
pub struct Flusher {
    client: reqwest::Client,
    endpoint: String,
    api_key: RwLock<String>,
    log_type: String,
    mode: DeliveryMode,
    retry: RetryConfig,
    max_payload_bytes: usize,
}

impl Flusher {
    pub fn new(config: &ShipperConfig) -> Result<Self, StartupError> {
        let client = build_client(config.https_proxy.as_deref(), config.request_timeout)?;
        Ok(Self::with_client(client, config))
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client, config: &ShipperConfig) -> Self {
        Flusher {
            client,
            endpoint: config.endpoint(),
            api_key: RwLock::new(config.api_key.clone()),
            log_type: config.log_type.clone(),
            mode: config.mode,
            retry: config.retry.clone(),
            max_payload_bytes: config.max_payload_bytes,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Replaces the API key used by subsequent requests.
    pub fn set_api_key(&self, api_key: String) {
        *self.api_key.write().unwrap_or_else(PoisonError::into_inner) = api_key;
    }

    fn api_key(&self) -> String {
        self.api_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn headers(&self, api_key: &str) -> Result<HeaderMap, ShippingError> {
        let invalid = |e: reqwest::header::InvalidHeaderValue| {
            ShippingError::Payload(format!("invalid header value: {e}"))
        };
        let mut authorization =
            HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(invalid)?;
        authorization.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("X-Log-Type", HeaderValue::from_str(&self.log_type).map_err(invalid)?);
        headers.insert("X-SDK-Version", HeaderValue::from_static(SDK_VERSION));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("teraops-sdk-rust/{SDK_VERSION}")).map_err(invalid)?,
        );
        Ok(headers)
    }

    /// Checks the API key with an empty payload.
    ///
    /// Only a refused key is fatal. An unreachable endpoint or an unexpected
    /// status is logged and startup continues; delivery retries later.
    pub async fn validate_api_key(&self) -> Result<(), StartupError> {
        let body = br#"{"logs":[]}"#.to_vec();
        match self.send_once(body, &self.api_key()).await {
            Ok(()) => {
                debug!("LOGS | API key validated successfully");
                Ok(())
            }
            Err(e @ ShippingError::Destination(status, _)) if e.is_auth() => {
                let reason = if status == StatusCode::UNAUTHORIZED {
                    "API key is invalid, check your api_key and try again"
                } else {
                    "API key is forbidden, it may be disabled or expired"
                };
                error!("LOGS | {}. {}", reason, e);
                Err(StartupError::InvalidApiKey {
                    status,
                    reason: reason.to_string(),
                })
            }
            Err(ShippingError::Payload(message)) => Err(StartupError::InvalidConfig(message)),
            Err(e) => {
                warn!(
                    "LOGS | Could not validate API key ({}). Starting anyway, delivery will retry.",
                    e
                );
                Ok(())
            }
        }
    }

    /// Ships a batch, chunk by chunk, in order.
    pub async fn ship<'a>(
        &self,
        records: impl IntoIterator<Item = &'a LogRecord>,
    ) -> ShipOutcome {
        let (chunks, unencodable) = self.build_chunks(records);
        let chunk_count = chunks.len();
        let mut delivered = 0;
        let mut rejected = unencodable;

        for (index, chunk) in chunks.into_iter().enumerate() {
            match self.send_with_retry(chunk.body).await {
                Ok(()) => delivered += chunk.records,
                Err(e @ ShippingError::Destination(status, _)) if e.is_auth() => {
                    error!(
                        "LOGS | Request was denied. {}. Suspending delivery until the API key is replaced.",
                        e
                    );
                    return ShipOutcome::Unauthorized(status);
                }
                Err(ShippingError::Destination(status, body)) if status.is_client_error() => {
                    warn!(
                        "LOGS | Chunk {}/{} with {} records rejected (HTTP {}): {}",
                        index + 1,
                        chunk_count,
                        chunk.records,
                        status,
                        body
                    );
                    rejected += chunk.records;
                }
                Err(e) => {
                    error!(
                        "LOGS | Failed to send chunk {}/{}: {}",
                        index + 1,
                        chunk_count,
                        e
                    );
                    return ShipOutcome::Failed;
                }
            }
        }

        ShipOutcome::Delivered {
            delivered,
            rejected,
        }
    }

    /// Serializes records into request bodies no larger than the payload limit.
    ///
    /// Records are never split. Returns the chunks and the number of records
    /// that could not be encoded.
    pub fn build_chunks<'a>(
        &self,
        records: impl IntoIterator<Item = &'a LogRecord>,
    ) -> (Vec<Chunk>, usize) {
        let budget = self.max_payload_bytes.saturating_sub(ENVELOPE_RESERVE).max(1);
        let mut groups: Vec<Vec<Vec<u8>>> = Vec::new();
        let mut current: Vec<Vec<u8>> = Vec::new();
        let mut current_bytes = 0;
        let mut unencodable = 0;

        for record in records {
            let encoded = match serde_json::to_vec(record) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!("LOGS | Dropping record that cannot be serialized: {}", e);
                    unencodable += 1;
                    continue;
                }
            };
            let separator = usize::from(!current.is_empty());
            if !current.is_empty() && current_bytes + separator + encoded.len() > budget {
                groups.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            if encoded.len() > budget {
                warn!(
                    "LOGS | Record of {} bytes exceeds the payload limit, sending it alone",
                    encoded.len()
                );
            }
            current_bytes += usize::from(!current.is_empty()) + encoded.len();
            current.push(encoded);
        }
        if !current.is_empty() {
            groups.push(current);
        }

        let batch_id = Uuid::new_v4().to_string();
        let chunk_count = groups.len();
        let chunks = groups
            .into_iter()
            .enumerate()
            .map(|(index, group)| self.envelope(&group, &batch_id, index, chunk_count))
            .collect();
        (chunks, unencodable)
    }

    fn envelope(&self, group: &[Vec<u8>], batch_id: &str, index: usize, count: usize) -> Chunk {
        let size: usize = group.iter().map(Vec::len).sum::<usize>() + group.len();
        let mut body = Vec::with_capacity(size + ENVELOPE_RESERVE);
        body.extend(b"{\"logs\":[");
        for (i, encoded) in group.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend(encoded);
        }
        body.extend(
            format!("],\"batch_id\":\"{batch_id}\",\"chunk_index\":{index},\"chunk_count\":{count}")
                .as_bytes(),
        );
        if self.mode == DeliveryMode::RealTime {
            body.extend(b",\"historical_data\":true");
        }
        body.push(b'}');
        Chunk {
            body,
            records: group.len(),
        }
    }

    async fn send_with_retry(&self, body: Vec<u8>) -> Result<(), ShippingError> {
        let api_key = self.api_key();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let time = Instant::now();
            let result = self.send_once(body.clone(), &api_key).await;
            let elapsed = time.elapsed();

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempts < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempts);
                    debug!(
                        "LOGS | Attempt {} failed after {} ms: {}. Retrying in {} ms",
                        attempts,
                        elapsed.as_millis(),
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!(
                            "LOGS | Failed to send request after {} attempts: {}",
                            attempts, e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn send_once(&self, body: Vec<u8>, api_key: &str) -> Result<(), ShippingError> {
        let headers = self.headers(api_key)?;
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        Err(ShippingError::Destination(status, body))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::enrichment::ResourceMetadata;
    use crate::record::Severity;
    use chrono::Utc;
    use mockito::{Matcher, Server};
    use serde_json::Value;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            severity: Severity::Info,
            message: message.to_string(),
            truncated: false,
            attributes: Default::default(),
            trace_id: None,
            span_id: None,
            resource: Arc::new(ResourceMetadata {
                hostname: "host".to_string(),
                process_id: 1,
                runtime: "Rust".to_string(),
                os: "linux".to_string(),
                arch: "x86_64".to_string(),
            }),
            sdk_version: SDK_VERSION.to_string(),
        }
    }

    fn config(url: &str) -> ShipperConfig {
        ShipperConfig {
            api_url: url.to_string(),
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                multiplier: 2.0,
                max_delay: Duration::from_millis(5),
            },
            ..ShipperConfig::new("test-key")
        }
    }

    fn flusher(url: &str) -> Flusher {
        Flusher::new(&config(url)).unwrap()
    }

    #[test]
    fn test_single_chunk_envelope() {
        let flusher = flusher("http://localhost");
        let (chunks, unencodable) = flusher.build_chunks(&[record("a"), record("b")]);
        assert_eq!(unencodable, 0);
        assert_eq!(chunks.len(), 1);

        let body: Value = serde_json::from_slice(&chunks[0].body).unwrap();
        assert_eq!(body["logs"].as_array().unwrap().len(), 2);
        assert_eq!(body["logs"][0]["message"], "a");
        assert_eq!(body["chunk_index"], 0);
        assert_eq!(body["chunk_count"], 1);
        assert!(Uuid::parse_str(body["batch_id"].as_str().unwrap()).is_ok());
        assert!(body.get("historical_data").is_none());
    }

    #[test]
    fn test_real_time_payload_is_flagged() {
        let flusher = Flusher::new(&ShipperConfig {
            mode: DeliveryMode::RealTime,
            ..config("http://localhost")
        })
        .unwrap();
        let (chunks, _) = flusher.build_chunks(&[record("a")]);
        let body: Value = serde_json::from_slice(&chunks[0].body).unwrap();
        assert_eq!(body["historical_data"], true);
    }

    #[test]
    fn test_chunks_respect_payload_limit() {
        let flusher = Flusher::new(&ShipperConfig {
            max_payload_bytes: 2_048,
            ..config("http://localhost")
        })
        .unwrap();
        let records: Vec<_> = (0..20).map(|i| record(&format!("{i}-{}", "x".repeat(200)))).collect();
        let (chunks, _) = flusher.build_chunks(&records);
        assert!(chunks.len() > 1);

        let mut batch_ids = Vec::new();
        let mut messages = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.body.len() <= 2_048);
            let body: Value = serde_json::from_slice(&chunk.body).unwrap();
            assert_eq!(body["chunk_index"], i);
            assert_eq!(body["chunk_count"], chunks.len());
            batch_ids.push(body["batch_id"].as_str().unwrap().to_string());
            for log in body["logs"].as_array().unwrap() {
                messages.push(log["message"].as_str().unwrap().to_string());
            }
        }
        batch_ids.dedup();
        assert_eq!(batch_ids.len(), 1);
        let expected: Vec<_> = records.iter().map(|r| r.message.clone()).collect();
        assert_eq!(messages, expected);
    }

    #[test]
    fn test_empty_batch_has_no_chunks() {
        let (chunks, _) = flusher("http://localhost").build_chunks(std::iter::empty());
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_ship_sends_headers() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/ingestion/ingest")
            .match_header("authorization", "Bearer test-key")
            .match_header("content-type", "application/json")
            .match_header("x-log-type", "otel")
            .match_header("x-sdk-version", SDK_VERSION)
            .match_header(
                "user-agent",
                Matcher::Exact(format!("teraops-sdk-rust/{SDK_VERSION}")),
            )
            .match_body(Matcher::Regex(r#"^\{"logs":\[\{.*"message":"hello".*"chunk_count":1\}$"#.to_string()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let outcome = flusher(&server.url()).ship(&[record("hello")]).await;
        assert_eq!(
            outcome,
            ShipOutcome::Delivered {
                delivered: 1,
                rejected: 0
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/ingestion/ingest")
            .with_status(503)
            .with_body("unavailable")
            .expect(3)
            .create_async()
            .await;

        let outcome = flusher(&server.url()).ship(&[record("a")]).await;
        assert_eq!(outcome, ShipOutcome::Failed);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/ingestion/ingest")
            .with_status(400)
            .with_body("bad payload")
            .expect(1)
            .create_async()
            .await;

        let outcome = flusher(&server.url()).ship(&[record("a"), record("b")]).await;
        assert_eq!(
            outcome,
            ShipOutcome::Delivered {
                delivered: 0,
                rejected: 2
            }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rejected_chunk_is_logged() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/ingestion/ingest")
            .with_status(422)
            .with_body("unprocessable")
            .create_async()
            .await;

        flusher(&server.url()).ship(&[record("a")]).await;
        assert!(logs_contain(
            "LOGS | Chunk 1/1 with 1 records rejected (HTTP 422 Unprocessable Entity): unprocessable"
        ));
    }

    #[tokio::test]
    async fn test_auth_errors_stop_the_batch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/ingestion/ingest")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let outcome = flusher(&server.url()).ship(&[record("a")]).await;
        assert_eq!(outcome, ShipOutcome::Unauthorized(StatusCode::UNAUTHORIZED));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_network_errors_are_retried_then_fail() {
        // Nothing listens on port 9 on the loopback interface.
        let outcome = flusher("http://127.0.0.1:9").ship(&[record("a")]).await;
        assert_eq!(outcome, ShipOutcome::Failed);
    }

    #[tokio::test]
    async fn test_set_api_key() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/ingestion/ingest")
            .match_header("authorization", "Bearer rotated")
            .with_status(202)
            .expect(1)
            .create_async()
            .await;

        let flusher = flusher(&server.url());
        flusher.set_api_key("rotated".to_string());
        assert!(matches!(
            flusher.ship(&[record("a")]).await,
            ShipOutcome::Delivered { delivered: 1, .. }
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_validate_api_key_accepted() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/ingestion/ingest")
            .match_body(r#"{"logs":[]}"#)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        assert!(flusher(&server.url()).validate_api_key().await.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_validate_api_key_refused() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/ingestion/ingest")
            .with_status(403)
            .create_async()
            .await;
        let result = flusher(&server.url()).validate_api_key().await;
        assert!(matches!(
            result,
            Err(StartupError::InvalidApiKey { status, .. }) if status == StatusCode::FORBIDDEN
        ));
    }

    #[tokio::test]
    async fn test_validate_api_key_ignores_other_statuses() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/ingestion/ingest")
            .with_status(500)
            .create_async()
            .await;
        assert!(flusher(&server.url()).validate_api_key().await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_api_key_tolerates_unreachable_endpoint() {
        assert!(flusher("http://127.0.0.1:9")
            .validate_api_key()
            .await
            .is_ok());
    }
}
