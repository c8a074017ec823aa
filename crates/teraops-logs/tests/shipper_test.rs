// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server};
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use teraops_logs::{
    FlushOutcome, Fault, LogEvent, LogShipper, LogSink, RetryConfig, ShipperConfig, StartupError,
};
use tempfile::TempDir;
use tokio::time::sleep;
use tracing_test::traced_test;

const INGEST_PATH: &str = "/api/ingestion/ingest";

fn config(url: &str, spillover_dir: Option<&Path>) -> ShipperConfig {
    ShipperConfig {
        api_url: url.to_string(),
        validate_api_key: false,
        spillover_enabled: spillover_dir.is_some(),
        spillover_dir: spillover_dir.map(Path::to_path_buf),
        flush_interval: Duration::from_secs(3_600),
        request_timeout: Duration::from_secs(2),
        retry: RetryConfig {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(1),
        },
        shutdown_timeout: Duration::from_secs(5),
        ..ShipperConfig::new("test-key")
    }
}

fn spilled_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .expect("spillover dir exists")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".jsonl"))
        .count()
}

#[tokio::test]
async fn invalid_api_key_prevents_startup() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", INGEST_PATH)
        .match_header("authorization", "Bearer test-key")
        .match_body(r#"{"logs":[]}"#)
        .with_status(401)
        .with_body(r#"{"error":"invalid api key"}"#)
        .expect(1)
        .create_async()
        .await;

    let config = ShipperConfig {
        validate_api_key: true,
        ..config(&server.url(), None)
    };
    let result = LogShipper::start(config).await;

    assert!(matches!(
        result,
        Err(StartupError::InvalidApiKey { status, .. }) if status == StatusCode::UNAUTHORIZED
    ));
    mock.assert_async().await;
}

#[tokio::test]
async fn force_flush_delivers_buffered_records() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", INGEST_PATH)
        .match_header("x-log-type", "otel")
        .match_body(Matcher::Regex(
            r#""message":"first".*"message":"second""#.to_string(),
        ))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let shipper = LogShipper::start(config(&server.url(), None))
        .await
        .expect("failed to start shipper");
    let sink: &dyn LogSink = &shipper;
    sink.accept(LogEvent::new("first"));
    sink.accept(LogEvent::new("second").with_severity("error"));
    assert_eq!(shipper.buffered_len(), 2);

    assert_eq!(
        shipper.force_flush().await,
        FlushOutcome::Delivered { records: 2 }
    );
    assert_eq!(shipper.buffered_len(), 0);
    assert_eq!(shipper.force_flush().await, FlushOutcome::Idle);

    let stats = shipper.stats();
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.delivered, 2);
    mock.assert_async().await;
    shipper.shutdown().await;
}

#[tokio::test]
async fn overflow_spills_while_endpoint_is_unreachable() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let shipper = LogShipper::start(config("http://127.0.0.1:9", Some(dir.path())))
        .await
        .expect("failed to start shipper");

    for i in 0..10_001 {
        shipper.accept(LogEvent::new(format!("record {i}")));
    }

    assert_eq!(shipper.buffered_len(), 10_000);
    assert_eq!(shipper.spilled_len(), 1);
    assert_eq!(shipper.stats().spilled, 1);
    shipper.shutdown().await;
}

#[tokio::test]
#[traced_test]
async fn unwritable_spillover_dir_degrades_to_memory_only() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let not_a_dir = dir.path().join("not-a-dir");
    std::fs::write(&not_a_dir, b"x").expect("failed to write file");

    let config = ShipperConfig {
        max_buffer_size: 2,
        high_water_mark: 2,
        ..config("http://127.0.0.1:9", Some(&not_a_dir.join("spill")))
    };
    let shipper = LogShipper::start(config)
        .await
        .expect("startup does not depend on spillover");

    for i in 0..3 {
        shipper.accept(LogEvent::new(format!("record {i}")));
    }

    assert_eq!(shipper.buffered_len(), 2);
    assert_eq!(shipper.spilled_len(), 0);
    assert_eq!(shipper.stats().dropped_overflow, 1);
    assert!(logs_contain("degrading to memory-only"));
    shipper.shutdown().await;
}

#[tokio::test]
async fn spilled_records_are_sent_in_order_after_recovery() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let mut server = Server::new_async().await;
    // The first two requests hit the outage, the next one succeeds.
    let outage = server
        .mock("POST", INGEST_PATH)
        .with_status(503)
        .expect(2)
        .create_async()
        .await;
    let in_order = (0..8)
        .map(|i| format!(r#""message":"record {i}""#))
        .collect::<Vec<_>>()
        .join(".*");
    let recovered = server
        .mock("POST", INGEST_PATH)
        .match_body(Matcher::Regex(in_order))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let config = ShipperConfig {
        max_buffer_size: 5,
        high_water_mark: 5,
        ..config(&server.url(), Some(dir.path()))
    };
    let shipper = LogShipper::start(config)
        .await
        .expect("failed to start shipper");

    for i in 0..8 {
        shipper.accept(LogEvent::new(format!("record {i}")));
    }
    assert_eq!(shipper.buffered_len(), 5);
    assert_eq!(shipper.spilled_len(), 3);

    // Let the high-water cycle run into the outage first.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(shipper.force_flush().await, FlushOutcome::Failed);

    // Nothing was acknowledged, so nothing left the disk.
    assert_eq!(shipper.buffered_len(), 5);
    assert_eq!(shipper.spilled_len(), 3);
    assert!(spilled_files(dir.path()) > 0);
    outage.assert_async().await;

    assert_eq!(
        shipper.force_flush().await,
        FlushOutcome::Delivered { records: 8 }
    );
    assert_eq!(shipper.buffered_len(), 0);
    assert_eq!(shipper.spilled_len(), 0);
    assert_eq!(spilled_files(dir.path()), 0);
    recovered.assert_async().await;

    let stats = shipper.stats();
    assert_eq!(stats.failed_batches, 2);
    assert_eq!(stats.delivered, 8);
    shipper.shutdown().await;
}

#[tokio::test]
async fn rejected_key_suspends_delivery_until_replaced() {
    let mut server = Server::new_async().await;
    let refused = server
        .mock("POST", INGEST_PATH)
        .match_header("authorization", "Bearer test-key")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("POST", INGEST_PATH)
        .match_header("authorization", "Bearer rotated-key")
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let shipper = LogShipper::start(config(&server.url(), None))
        .await
        .expect("failed to start shipper");
    shipper.accept(LogEvent::new("payment processed"));

    assert_eq!(shipper.force_flush().await, FlushOutcome::Suspended);
    assert_eq!(
        shipper.fault(),
        Some(Fault::Unauthorized {
            status: StatusCode::UNAUTHORIZED
        })
    );
    // Suspended cycles do not touch the network.
    assert_eq!(shipper.force_flush().await, FlushOutcome::Suspended);
    assert_eq!(shipper.buffered_len(), 1);
    refused.assert_async().await;

    shipper.set_api_key("rotated-key");
    assert!(shipper.fault().is_none());
    assert_eq!(
        shipper.force_flush().await,
        FlushOutcome::Delivered { records: 1 }
    );
    accepted.assert_async().await;
    shipper.shutdown().await;
}

#[tokio::test]
async fn shutdown_flushes_remaining_records() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", INGEST_PATH)
        .match_body(Matcher::Regex(r#""message":"last words""#.to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let shipper = LogShipper::start(config(&server.url(), None))
        .await
        .expect("failed to start shipper");
    shipper.accept(LogEvent::new("last words"));
    shipper.shutdown().await;

    mock.assert_async().await;
}
