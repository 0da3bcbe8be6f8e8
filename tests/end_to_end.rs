//! End-to-end scenarios driving the whole stack together: connector handshake,
//! harvest processor main loop, and delivery, against a mocked collector.

use std::sync::Arc;
use std::time::Duration;

use apm_agent_core::collector::ConfigBuilder;
use apm_agent_core::domain::{RuleOutcome, Transaction, WebRequestInfo};
use apm_agent_core::domain_types::ApdexThresholdSeconds;
use apm_agent_core::processor::{HarvestProcessor, Telemetry};
use apm_agent_core::time_provider::test_time_provider;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn wait_for_connect(processor: &HarvestProcessor) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if processor.current_run().await.is_some() {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "processor never connected");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn mount_successful_handshake(server: &MockServer, run_id: &str) {
    Mock::given(method("POST"))
        .and(path("/agent_listener/invoke_raw_method"))
        .and(query_param("method", "preconnect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "return_value": { "redirect_host": server.address().to_string() }
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/agent_listener/invoke_raw_method"))
        .and(query_param("method", "connect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "return_value": { "agent_run_id": run_id, "apdex_t": 0.5 }
        })))
        .mount(server)
        .await;
}

/// Scenario 1: a simple web transaction is started, ends successfully, and
/// its metric and transaction event both reach the collector on the next
/// harvest tick.
#[tokio::test]
async fn simple_web_transaction_is_delivered() {
    let server = MockServer::start().await;
    mount_successful_handshake(&server, "run-simple").await;
    Mock::given(method("POST"))
        .and(path("/agent_listener/invoke_raw_method"))
        .and(query_param("method", "metric_data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "return_value": [] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/agent_listener/invoke_raw_method"))
        .and(query_param("method", "analytic_event_data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "return_value": [] })))
        .mount(&server)
        .await;

    let config = ConfigBuilder::new()
        .license_key("abcd1234")
        .app_name("e2e-simple")
        .host(server.uri())
        .build()
        .unwrap();
    let processor = Arc::new(HarvestProcessor::new(config, test_time_provider(), 1));
    let driver = Arc::clone(&processor);
    tokio::spawn(async move { driver.run().await });

    wait_for_connect(&processor).await;

    let txn = Transaction::start(
        "WebTransaction/Go/hello",
        Some(WebRequestInfo {
            method: "GET".to_string(),
            uri: "/hello".to_string(),
            host: "localhost".to_string(),
            ..WebRequestInfo::default()
        }),
        false,
        true,
        Vec::new(),
    );
    txn.write_header(200);
    let ended = txn
        .end(|name| RuleOutcome::Kept(name.to_string()), ApdexThresholdSeconds::default())
        .unwrap()
        .unwrap();

    let sender = processor.data_sender().await.expect("processor should be connected by now");
    sender.send(Telemetry::EndedTransaction(Box::new(ended))).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let requests = server.received_requests().await.unwrap_or_default();
        let delivered = requests.iter().any(|r| r.url.query().is_some_and(|q| q.contains("method=metric_data")));
        if delivered {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "metric_data was never delivered to the collector");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Scenario 5: a transient 503 on metric delivery is merged back into the
/// next harvest interval instead of being dropped, and the agent stays
/// connected throughout.
#[tokio::test]
async fn transient_delivery_failure_merges_back_and_retries() {
    let server = MockServer::start().await;
    mount_successful_handshake(&server, "run-merge").await;
    Mock::given(method("POST"))
        .and(path("/agent_listener/invoke_raw_method"))
        .and(query_param("method", "metric_data"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/agent_listener/invoke_raw_method"))
        .and(query_param("method", "metric_data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "return_value": [] })))
        .mount(&server)
        .await;

    let config = ConfigBuilder::new()
        .license_key("abcd1234")
        .app_name("e2e-merge")
        .host(server.uri())
        .build()
        .unwrap();
    let processor = Arc::new(HarvestProcessor::new(config, test_time_provider(), 1));
    let driver = Arc::clone(&processor);
    tokio::spawn(async move { driver.run().await });

    wait_for_connect(&processor).await;

    let sender = processor.data_sender().await.expect("processor should be connected");
    sender.send(Telemetry::ForcedMetric { name: "Instance/CPU".to_string(), value: 0.42 }).await;

    // Give the processor a few harvest ticks to retry through the 503 and
    // succeed on the second attempt; the processor must stay connected
    // throughout since a transient failure is not fatal.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(processor.current_run().await.is_some(), "a transient delivery failure must not disconnect the agent");

    let requests = server.received_requests().await.unwrap_or_default();
    let metric_attempts = requests.iter().filter(|r| r.url.query().is_some_and(|q| q.contains("method=metric_data"))).count();
    assert!(metric_attempts >= 2, "expected at least one retry after the transient failure, got {metric_attempts} attempt(s)");
}

/// Scenario 6: a force-restart response during harvest delivery clears the
/// current run and the connector reconnects automatically.
#[tokio::test]
async fn force_restart_during_delivery_triggers_a_reconnect() {
    let server = MockServer::start().await;
    mount_successful_handshake(&server, "run-restart").await;
    Mock::given(method("POST"))
        .and(path("/agent_listener/invoke_raw_method"))
        .and(query_param("method", "metric_data"))
        .respond_with(ResponseTemplate::new(409))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/agent_listener/invoke_raw_method"))
        .and(query_param("method", "metric_data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "return_value": [] })))
        .mount(&server)
        .await;

    let config = ConfigBuilder::new()
        .license_key("abcd1234")
        .app_name("e2e-restart")
        .host(server.uri())
        .build()
        .unwrap();
    let processor = Arc::new(HarvestProcessor::new(config, test_time_provider(), 1));
    let driver = Arc::clone(&processor);
    tokio::spawn(async move { driver.run().await });

    wait_for_connect(&processor).await;

    let sender = processor.data_sender().await.expect("processor should be connected");
    sender.send(Telemetry::ForcedMetric { name: "Instance/CPU".to_string(), value: 0.9 }).await;

    // The 409 response classifies as ForceRestart: current_run is cleared at
    // some point, and a fresh connector attempt reconnects without the
    // processor shutting down entirely.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut saw_disconnect = false;
    loop {
        if processor.current_run().await.is_none() {
            saw_disconnect = true;
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(saw_disconnect, "force-restart should have cleared the current run at some point");

    wait_for_connect(&processor).await;
}
