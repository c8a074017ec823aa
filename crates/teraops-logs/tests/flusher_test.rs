// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server};
use std::time::Duration;
use teraops_logs::constants::MAX_PAYLOAD_BYTES;
use teraops_logs::enrichment::{Enricher, ResourceMetadata};
use teraops_logs::flusher::{Flusher, ShipOutcome};
use teraops_logs::normalizer::normalize;
use teraops_logs::{LogEvent, LogRecord, RetryConfig, ShipperConfig};

const INGEST_PATH: &str = "/api/ingestion/ingest";

/// 60 records of about 100 KB each, roughly 6 MB in total.
fn six_megabyte_batch() -> Vec<LogRecord> {
    let enricher = Enricher::new(ResourceMetadata::detect());
    (0..60)
        .map(|i| {
            let event = normalize(LogEvent::new(format!("{i:02} {}", "x".repeat(100_000))))
                .expect("event has content");
            enricher.enrich(event)
        })
        .collect()
}

fn flusher(url: &str, max_attempts: u32) -> Flusher {
    let config = ShipperConfig {
        api_url: url.to_string(),
        retry: RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5),
        },
        ..ShipperConfig::new("mock-api-key")
    };
    Flusher::new(&config).expect("failed to create flusher")
}

#[test]
fn large_batch_is_split_into_bounded_chunks() {
    let records = six_megabyte_batch();
    let (chunks, unencodable) = flusher("http://localhost", 1).build_chunks(&records);

    assert_eq!(unencodable, 0);
    assert_eq!(chunks.len(), 2);
    for chunk in &chunks {
        assert!(chunk.body.len() <= MAX_PAYLOAD_BYTES);
    }
    assert_eq!(chunks.iter().map(|c| c.records).sum::<usize>(), 60);
}

#[tokio::test]
async fn large_batch_is_sent_as_two_requests() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", INGEST_PATH)
        .match_header("authorization", "Bearer mock-api-key")
        .match_body(Matcher::Regex(r#""chunk_count":2"#.to_string()))
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let outcome = flusher(&server.url(), 1).ship(&six_megabyte_batch()).await;

    assert_eq!(
        outcome,
        ShipOutcome::Delivered {
            delivered: 60,
            rejected: 0
        }
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn batch_fails_when_any_chunk_fails() {
    let mut server = Server::new_async().await;
    let first = server
        .mock("POST", INGEST_PATH)
        .match_body(Matcher::Regex(r#""chunk_index":0,"#.to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("POST", INGEST_PATH)
        .match_body(Matcher::Regex(r#""chunk_index":1,"#.to_string()))
        .with_status(503)
        .expect(2)
        .create_async()
        .await;

    let outcome = flusher(&server.url(), 2).ship(&six_megabyte_batch()).await;

    assert_eq!(outcome, ShipOutcome::Failed);
    first.assert_async().await;
    second.assert_async().await;
}
