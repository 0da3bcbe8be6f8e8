//! Demo host application: attaches the agent core to a handful of simulated
//! transactions and lets the harvest processor connect and report them.
//!
//! This binary exists to exercise the crate end-to-end without requiring a
//! real web framework; a production host would call the same
//! `Transaction`/`HarvestProcessor` API from its request-handling code.

use std::sync::Arc;
use std::time::Duration;

use apm_agent_core::collector::ConfigBuilder;
use apm_agent_core::domain::{RuleOutcome, Transaction, WebRequestInfo};
use apm_agent_core::domain_types::ApdexThresholdSeconds;
use apm_agent_core::processor::{HarvestProcessor, Telemetry};
use apm_agent_core::time_provider::production_time_provider;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("apm_agent_core=info".parse()?),
        )
        .init();

    let config = ConfigBuilder::new()
        .from_env()
        .license_key(std::env::var("NEW_RELIC_LICENSE_KEY").unwrap_or_else(|_| "0".repeat(40)))
        .app_name(std::env::var("NEW_RELIC_APP_NAME").unwrap_or_else(|_| "apm-agent-demo".to_string()))
        .build()?;

    info!(app_name = %config.app_name, host = %config.host, "starting demo host application");

    let processor = Arc::new(HarvestProcessor::new(config, production_time_provider(), std::process::id()));
    let driver = Arc::clone(&processor);
    tokio::spawn(async move { driver.run().await });

    for i in 0..3 {
        simulate_request(&processor, i).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    warn!("demo host application has no more simulated traffic; sleeping so a pending harvest can flush");
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(())
}

async fn simulate_request(processor: &HarvestProcessor, i: u32) {
    let txn = Transaction::start(
        "WebTransaction/Go/hello",
        Some(WebRequestInfo {
            method: "GET".to_string(),
            uri: format!("/hello/{i}"),
            host: "localhost".to_string(),
            ..WebRequestInfo::default()
        }),
        false,
        true,
        Vec::new(),
    );
    let segment = txn.start_segment(None);
    tokio::time::sleep(Duration::from_millis(10)).await;
    txn.end_segment(segment, "work");
    txn.write_header(200);

    let ended = txn.end(
        |name| RuleOutcome::Kept(name.to_string()),
        ApdexThresholdSeconds::default(),
    );

    if let Ok(Some(ended)) = ended {
        if let Some(sender) = processor.data_sender().await {
            sender.send(Telemetry::EndedTransaction(Box::new(ended))).await;
        } else {
            warn!(request = i, "processor not yet connected, dropping simulated transaction");
        }
    }

    info!(request = i, "simulated transaction completed");
}
