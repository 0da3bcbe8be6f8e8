//! Delivery task: one POST per endpoint, classifying the response (§4.1).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{instrument, warn};

use crate::collector::client::CollectorClient;
use crate::collector::wire::{event_payload, event_triplet, metric_data_payload};
use crate::domain::agent_run::AgentRun;
use crate::domain_types::LicenseKey;
use crate::error::CollectorError;
use crate::harvest::harvest::Harvest;

/// Outcome of attempting to deliver one harvest.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Every non-empty endpoint was accepted.
    Delivered,
    /// Some endpoint(s) failed transiently; their payload should be merged
    /// back into the processor's current harvest.
    MergeBack(Harvest),
    /// A terminal collector response arrived; the processor must disconnect.
    Fatal(CollectorError),
}

enum EndpointOutcome {
    Delivered,
    Dropped,
    Retry,
    Fatal(CollectorError),
}

fn classify(result: Result<Value, CollectorError>) -> EndpointOutcome {
    match result {
        Ok(_) => EndpointOutcome::Delivered,
        Err(CollectorError::PayloadTooLarge | CollectorError::UnsupportedMedia) => EndpointOutcome::Dropped,
        Err(err @ (CollectorError::InvalidLicense | CollectorError::ForceDisconnect | CollectorError::ForceRestart)) => {
            EndpointOutcome::Fatal(err)
        }
        Err(err @ CollectorError::Transient(_)) => {
            warn!(%err, "endpoint delivery failed transiently, will merge back");
            EndpointOutcome::Retry
        }
    }
}

fn epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Posts each non-empty endpoint of a harvest to the collector, in the
/// teacher's one-payload-per-endpoint shape.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    client: CollectorClient,
    license_key: LicenseKey,
}

impl DeliveryTask {
    #[must_use]
    pub fn new(license_key: LicenseKey) -> Self {
        Self {
            client: CollectorClient::new(),
            license_key,
        }
    }

    async fn send(&self, agent_run: &AgentRun, method: &str, body: &[Value]) -> EndpointOutcome {
        classify(
            self.client
                .invoke(&agent_run.collector_host, method, self.license_key.as_ref(), Some(&agent_run.run_id), body)
                .await,
        )
    }

    /// Delivers every non-empty endpoint of `harvest`, stopping immediately
    /// on the first fatal response and otherwise collecting failed endpoints
    /// into a leftover [`Harvest`] for the processor to merge back (§4.1).
    #[instrument(skip(self, agent_run, harvest), fields(run_id = %agent_run.run_id))]
    pub async fn deliver(&self, agent_run: &AgentRun, harvest: Harvest) -> DeliveryOutcome {
        let end = SystemTime::now();
        let Harvest {
            begin,
            metrics,
            txn_events,
            custom_events,
            error_events,
            span_events,
            traces,
            error_traces,
            slow_queries,
        } = harvest;

        let mut leftover = Harvest::new(agent_run, begin);
        let mut needs_merge_back = false;

        if !metrics.is_empty() {
            let body = metric_data_payload(&agent_run.run_id, epoch_secs(begin), epoch_secs(end), metrics.iter().map(|(k, v)| (k.clone(), *v)));
            match self.send(agent_run, "metric_data", &[body]).await {
                EndpointOutcome::Fatal(e) => return DeliveryOutcome::Fatal(e),
                EndpointOutcome::Retry => {
                    leftover.metrics = metrics;
                    needs_merge_back = true;
                }
                EndpointOutcome::Delivered | EndpointOutcome::Dropped => {}
            }
        }

        if !txn_events.is_empty() {
            let events: Vec<Value> = txn_events
                .values()
                .map(|e| {
                    let mut intrinsics = std::collections::BTreeMap::new();
                    intrinsics.insert("name".to_string(), Value::String(e.name.clone()));
                    intrinsics.insert("duration".to_string(), serde_json::json!(e.duration.as_secs_f64()));
                    intrinsics.insert("type".to_string(), Value::String("Transaction".to_string()));
                    event_triplet(intrinsics, &e.user_attributes, &e.agent_attributes)
                })
                .collect();
            let body = event_payload(&agent_run.run_id, agent_run.harvest_caps.analytic_event_data.as_usize(), events.len() as u64, events);
            match self.send(agent_run, "analytic_event_data", &[body]).await {
                EndpointOutcome::Fatal(e) => return DeliveryOutcome::Fatal(e),
                EndpointOutcome::Retry => {
                    leftover.txn_events = txn_events;
                    needs_merge_back = true;
                }
                EndpointOutcome::Delivered | EndpointOutcome::Dropped => {}
            }
        }

        if !custom_events.is_empty() {
            let events: Vec<Value> = custom_events
                .values()
                .map(|e| {
                    let mut intrinsics = std::collections::BTreeMap::new();
                    intrinsics.insert("type".to_string(), Value::String(e.event_type.clone()));
                    intrinsics.insert("timestamp".to_string(), serde_json::json!(epoch_secs(e.when)));
                    let attrs: Vec<_> = e.attributes.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    event_triplet(intrinsics, &attrs, &[])
                })
                .collect();
            let body = event_payload(&agent_run.run_id, agent_run.harvest_caps.custom_event_data.as_usize(), events.len() as u64, events);
            match self.send(agent_run, "custom_event_data", &[body]).await {
                EndpointOutcome::Fatal(e) => return DeliveryOutcome::Fatal(e),
                EndpointOutcome::Retry => {
                    leftover.custom_events = custom_events;
                    needs_merge_back = true;
                }
                EndpointOutcome::Delivered | EndpointOutcome::Dropped => {}
            }
        }

        if !error_events.is_empty() {
            let events: Vec<Value> = error_events
                .values()
                .map(|e| {
                    let mut intrinsics = std::collections::BTreeMap::new();
                    intrinsics.insert("type".to_string(), Value::String("TransactionError".to_string()));
                    intrinsics.insert("error.class".to_string(), Value::String(e.class.clone()));
                    intrinsics.insert("error.message".to_string(), Value::String(e.message.clone()));
                    intrinsics.insert("transactionName".to_string(), Value::String(e.transaction_name.clone()));
                    intrinsics.insert("timestamp".to_string(), serde_json::json!(epoch_secs(e.when)));
                    event_triplet(intrinsics, &[], &[])
                })
                .collect();
            let body = event_payload(&agent_run.run_id, agent_run.harvest_caps.error_event_data.as_usize(), events.len() as u64, events);
            match self.send(agent_run, "error_event_data", &[body]).await {
                EndpointOutcome::Fatal(e) => return DeliveryOutcome::Fatal(e),
                EndpointOutcome::Retry => {
                    leftover.error_events = error_events;
                    needs_merge_back = true;
                }
                EndpointOutcome::Delivered | EndpointOutcome::Dropped => {}
            }
        }

        if !span_events.is_empty() {
            let events: Vec<Value> = span_events
                .values()
                .map(|e| {
                    let mut intrinsics = std::collections::BTreeMap::new();
                    intrinsics.insert("name".to_string(), Value::String(e.name.clone()));
                    intrinsics.insert("duration".to_string(), serde_json::json!(e.duration.as_secs_f64()));
                    intrinsics.insert("transaction.name".to_string(), Value::String(e.transaction_name.clone()));
                    intrinsics.insert("category".to_string(), Value::String("generic".to_string()));
                    event_triplet(intrinsics, &[], &[])
                })
                .collect();
            let body = event_payload(&agent_run.run_id, agent_run.harvest_caps.span_event_data.as_usize(), events.len() as u64, events);
            match self.send(agent_run, "span_event_data", &[body]).await {
                EndpointOutcome::Fatal(e) => return DeliveryOutcome::Fatal(e),
                EndpointOutcome::Retry => {
                    leftover.span_events = span_events;
                    needs_merge_back = true;
                }
                EndpointOutcome::Delivered | EndpointOutcome::Dropped => {}
            }
        }

        if !traces.is_empty() {
            let mut entries = Vec::new();
            if let Some(trace) = traces.slowest() {
                entries.push(serde_json::json!([
                    epoch_secs(end) * 1000.0,
                    trace.duration.as_secs_f64() * 1000.0,
                    trace.transaction_name,
                    trace.transaction_name,
                    serde_json::to_value(&trace.root_nodes).unwrap_or(Value::Null),
                ]));
            }
            for trace in traces.key_transaction_traces() {
                entries.push(serde_json::json!([
                    epoch_secs(end) * 1000.0,
                    trace.duration.as_secs_f64() * 1000.0,
                    trace.transaction_name,
                    trace.transaction_name,
                    serde_json::to_value(&trace.root_nodes).unwrap_or(Value::Null),
                ]));
            }
            let body = serde_json::json!([agent_run.run_id.to_string(), entries]);
            match self.send(agent_run, "transaction_sample_data", &[body]).await {
                EndpointOutcome::Fatal(e) => return DeliveryOutcome::Fatal(e),
                EndpointOutcome::Retry => {
                    leftover.traces = traces;
                    needs_merge_back = true;
                }
                EndpointOutcome::Delivered | EndpointOutcome::Dropped => {}
            }
        }

        if !error_traces.is_empty() {
            let entries: Vec<Value> = error_traces
                .iter()
                .map(|e| {
                    serde_json::json!([
                        epoch_secs(e.when) * 1000.0,
                        "",
                        e.message,
                        e.class,
                        { "stack_trace": e.stack },
                    ])
                })
                .collect();
            let body = serde_json::json!([agent_run.run_id.to_string(), entries]);
            match self.send(agent_run, "error_data", &[body]).await {
                EndpointOutcome::Fatal(e) => return DeliveryOutcome::Fatal(e),
                EndpointOutcome::Retry => {
                    leftover.error_traces = error_traces;
                    needs_merge_back = true;
                }
                EndpointOutcome::Delivered | EndpointOutcome::Dropped => {}
            }
        }

        if !slow_queries.is_empty() {
            let entries: Vec<Value> = slow_queries
                .iter()
                .map(|(fingerprint, stats)| {
                    serde_json::json!([
                        fingerprint,
                        stats.sample_query,
                        stats.call_count,
                        stats.total_duration.as_secs_f64() * 1000.0,
                        stats.min_duration.as_secs_f64() * 1000.0,
                        stats.max_duration.as_secs_f64() * 1000.0,
                        stats.sample_params,
                    ])
                })
                .collect();
            let body = serde_json::json!([agent_run.run_id.to_string(), entries]);
            match self.send(agent_run, "sql_trace_data", &[body]).await {
                EndpointOutcome::Fatal(e) => return DeliveryOutcome::Fatal(e),
                EndpointOutcome::Retry => {
                    leftover.slow_queries = slow_queries;
                    needs_merge_back = true;
                }
                EndpointOutcome::Delivered | EndpointOutcome::Dropped => {}
            }
        }

        if needs_merge_back {
            DeliveryOutcome::MergeBack(leftover)
        } else {
            DeliveryOutcome::Delivered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent_run::HarvestCaps;
    use crate::domain::rules::RuleSet;
    use crate::domain_types::{ApdexThresholdSeconds, Priority, RunId};
    use std::collections::HashMap;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_run(host: String) -> AgentRun {
        AgentRun {
            run_id: RunId::try_from("run-1".to_string()).unwrap(),
            collector_host: host,
            metric_rules: Arc::new(RuleSet::default()),
            url_rules: Arc::new(RuleSet::default()),
            txn_name_rules: Arc::new(RuleSet::default()),
            segment_terms: Arc::new(RuleSet::default()),
            harvest_caps: HarvestCaps::default(),
            collect_traces: true,
            collect_errors: true,
            collect_error_events: true,
            collect_analytics_events: true,
            collect_custom_events: true,
            apdex_threshold_seconds: ApdexThresholdSeconds::default(),
            key_transactions: HashMap::new(),
            sampling_target: 10,
            sampling_target_period_seconds: 60,
            trusted_account_key: "trust".to_string(),
            security_policies_enabled: false,
            tracer_threshold: Duration::from_millis(500),
            attribute_filter: Arc::new(crate::domain::attributes::DestinationFilter::permit_all()),
        }
    }

    #[tokio::test]
    async fn empty_harvest_needs_no_requests_and_is_delivered() {
        let server = MockServer::start().await;
        let run = sample_run(server.uri());
        let task = DeliveryTask::new(LicenseKey::try_new("abcd1234").unwrap());
        let harvest = Harvest::new(&run, SystemTime::now());
        let outcome = task.deliver(&run, harvest).await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered));
    }

    #[tokio::test]
    async fn successful_metric_delivery_reports_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent_listener/invoke_raw_method"))
            .and(query_param("method", "metric_data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "return_value": [] })))
            .mount(&server)
            .await;

        let run = sample_run(server.uri());
        let task = DeliveryTask::new(LicenseKey::try_new("abcd1234").unwrap());
        let mut harvest = Harvest::new(&run, SystemTime::now());
        harvest.record_forced_metric("Instance/CPU", 0.2);

        let outcome = task.deliver(&run, harvest).await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered));
    }

    #[tokio::test]
    async fn transient_failure_merges_the_payload_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent_listener/invoke_raw_method"))
            .and(query_param("method", "metric_data"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let run = sample_run(server.uri());
        let task = DeliveryTask::new(LicenseKey::try_new("abcd1234").unwrap());
        let mut harvest = Harvest::new(&run, SystemTime::now());
        harvest.record_forced_metric("Instance/CPU", 0.2);

        let outcome = task.deliver(&run, harvest).await;
        match outcome {
            DeliveryOutcome::MergeBack(leftover) => assert!(!leftover.metrics.is_empty()),
            _ => panic!("expected a merge-back outcome"),
        }
    }

    #[tokio::test]
    async fn invalid_license_status_stops_delivery_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent_listener/invoke_raw_method"))
            .and(query_param("method", "metric_data"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let run = sample_run(server.uri());
        let task = DeliveryTask::new(LicenseKey::try_new("abcd1234").unwrap());
        let mut harvest = Harvest::new(&run, SystemTime::now());
        harvest.record_forced_metric("Instance/CPU", 0.2);
        harvest.record_custom_event("Widget", std::collections::BTreeMap::new(), Priority::try_new(0.5).unwrap(), SystemTime::now());

        let outcome = task.deliver(&run, harvest).await;
        assert!(matches!(outcome, DeliveryOutcome::Fatal(CollectorError::InvalidLicense)));
    }
}
