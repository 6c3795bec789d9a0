//! Cross-crate integration and E2E tests
//!
//! These tests drive recorded ops and evaluations through a real client
//! and the HTTP transport into a mock ingestion backend, then check what
//! the backend received.

use std::time::Duration;

use serde_json::{Value, json};
use skein_client::testing::{MockIngestServer, http_config};
use skein_client::{Client, ClientConfig, Op, TransportMode, op, with_attributes};
use skein_eval::{Dataset, EVALUATE_OP, Evaluation, model, scorer};
use skein_trace::{Attributes, CallLogWriter, CallStatus, CallTree, WriterConfig, records_from_ops};

fn row(pairs: &[(&str, Value)]) -> Attributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// E2E Test: nested ops delivered over HTTP
///
/// A parent op awaits two children; the backend must receive all three
/// calls with the caller's attributes and correct parent links.
#[tokio::test]
async fn test_e2e_nested_calls_over_http() {
    let server = MockIngestServer::start().await;
    let client = Client::new(http_config(&server.url())).unwrap();

    let lookup = Op::builder("lookup").build(|key: String| async move {
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok::<_, std::io::Error>(key.len())
    });
    let pipeline = {
        let lookup = lookup.clone();
        Op::builder("pipeline").build(move |keys: Vec<String>| {
            let lookup = lookup.clone();
            async move {
                let mut total = 0;
                for key in keys {
                    total += lookup.call(key).await?;
                }
                Ok::<_, std::io::Error>(total)
            }
        })
    };

    let total = client
        .scope(with_attributes(
            row(&[("env", json!("test"))]),
            pipeline.call(vec!["ab".into(), "cde".into()]),
        ))
        .await
        .unwrap();
    assert_eq!(total, 5);

    client.wait_for_batch_processing().await;

    let records = server.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.attributes["env"] == json!("test")));
    assert!(records.iter().all(|r| r.status == CallStatus::Finished));
    assert!(CallTree::validate(&records).is_empty());

    let tree = CallTree::build(records).unwrap();
    assert_eq!(tree.roots.len(), 1);
    assert_eq!(tree.roots[0].record.op_name, pipeline.id());
    assert_eq!(tree.roots[0].children.len(), 2);
    assert_eq!(tree.roots[0].record.output, Some(json!(5)));

    assert!(
        server
            .auth_headers()
            .iter()
            .all(|h| h == "Bearer test-key")
    );

    client.shutdown().await.unwrap();
    server.shutdown().await;
}

/// E2E Test: server errors are retried until delivery succeeds
#[tokio::test]
async fn test_e2e_retries_server_errors() {
    let server = MockIngestServer::start().await;
    server.fail_next_requests(2, 503);
    let client = Client::new(http_config(&server.url())).unwrap();

    let ping = op(|n: u32| async move { Ok::<_, std::io::Error>(n + 1) });
    client.scope(ping.call(1)).await.unwrap();
    client.wait_for_batch_processing().await;

    assert_eq!(server.request_count(), 3);
    assert_eq!(server.records().len(), 1);
    assert_eq!(client.stats().failed, 0);

    client.shutdown().await.unwrap();
    server.shutdown().await;
}

/// E2E Test: a terminal HTTP status is not retried and is reported
#[tokio::test]
async fn test_e2e_unauthorized_is_terminal() {
    let server = MockIngestServer::start().await;
    server.fail_next_requests(1, 401);
    let client = Client::new(http_config(&server.url())).unwrap();
    let mut failures = client.delivery_failures();

    let ping = op(|n: u32| async move { Ok::<_, std::io::Error>(n) });
    client.scope(ping.call(7)).await.unwrap();
    client.wait_for_batch_processing().await;

    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.attempts, 1);
    assert!(failure.reason.contains("401"));
    assert_eq!(server.request_count(), 1);
    assert!(server.records().is_empty());

    client.shutdown().await.unwrap();
    server.shutdown().await;
}

/// E2E Test: entries rejected by the backend are reported, others delivered
#[tokio::test]
async fn test_e2e_rejected_entries_reported() {
    let server = MockIngestServer::start().await;
    let mut config = http_config(&server.url());
    config.retry.max_retries = 1;
    config.batch.max_flush_interval_ms = 200;
    let client = Client::new(config).unwrap();
    let mut failures = client.delivery_failures();

    let echo = op(|s: String| async move { Ok::<_, std::io::Error>(s) });
    let (_, kept) = client.scope(echo.call_with_call("kept".into())).await;
    let (_, refused) = client.scope(echo.call_with_call("refused".into())).await;
    server.reject_call(refused.id().clone(), "payload too large");

    client.wait_for_batch_processing().await;

    let first = failures.recv().await.unwrap();
    assert_eq!(&first.call_id, refused.id());
    assert_eq!(first.reason, "payload too large");
    assert_eq!(first.attempts, 2);

    let records = server.records();
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0].id, kept.id());

    client.shutdown().await.unwrap();
    server.shutdown().await;
}

/// E2E Test: an evaluation arrives at the backend as one tree
#[tokio::test]
async fn test_e2e_evaluation_over_http() {
    let server = MockIngestServer::start().await;
    let client = Client::new(http_config(&server.url())).unwrap();

    let dataset = Dataset::new(
        "capitals",
        vec![
            row(&[("country", json!("France")), ("expected", json!("Paris"))]),
            row(&[("country", json!("Japan")), ("expected", json!("Tokyo"))]),
            row(&[("country", json!("Peru")), ("expected", json!("Quito"))]),
        ],
    );
    let capital = model("capital", |row: Attributes| async move {
        let answer = match row["country"].as_str() {
            Some("France") => "Paris",
            Some("Japan") => "Tokyo",
            _ => "Lima",
        };
        Ok(json!(answer))
    });
    let correct = scorer("correct", |output: Value, row: Attributes| async move {
        Ok(json!(output == row["expected"]))
    });

    let results = client
        .scope(Evaluation::new(dataset, vec![correct.clone()]).evaluate(&capital))
        .await;
    client.wait_for_batch_processing().await;

    let mean = results.summary[correct.id()]["mean"].as_f64().unwrap();
    assert!((mean - 2.0 / 3.0).abs() < 1e-9);

    let tree = CallTree::build(server.records()).unwrap();
    assert_eq!(tree.len(), 7);
    assert_eq!(tree.roots.len(), 1);
    let root = &tree.roots[0];
    assert_eq!(root.record.op_name, EVALUATE_OP);
    assert_eq!(root.record.output.as_ref(), Some(&results.summary));
    assert_eq!(tree.by_op(capital.id()).len(), 3);
    assert_eq!(tree.by_op(correct.id()).len(), 3);

    client.shutdown().await.unwrap();
    server.shutdown().await;
}

/// E2E Test: health check reaches the backend
#[tokio::test]
async fn test_e2e_health_check() {
    let server = MockIngestServer::start().await;
    let client = Client::new(http_config(&server.url())).unwrap();

    client.health_check().await.unwrap();

    client.shutdown().await.unwrap();
    server.shutdown().await;
}

/// E2E Test: file mode writes a JSONL call log instead of sending
#[tokio::test]
async fn test_e2e_file_mode_call_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ClientConfig::default();
    config.transport.mode = TransportMode::File;
    config.transport.log_path = dir.path().join("calls");
    config.batch.max_flush_interval_ms = 20;
    let client = Client::new(config).unwrap();

    let double = op(|n: i64| async move { Ok::<_, std::io::Error>(n * 2) });
    client.scope(double.call(21)).await.unwrap();
    client.shutdown().await.unwrap();

    let reader = CallLogWriter::new(WriterConfig::daily_rotation(dir.path().join("calls"))).unwrap();
    let files = reader.list_log_files().unwrap();
    assert_eq!(files.len(), 1);

    let ops = CallLogWriter::read_ops(&files[0]).unwrap();
    let records = records_from_ops(&ops);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].output, Some(json!(42)));
}
