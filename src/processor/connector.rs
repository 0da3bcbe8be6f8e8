//! Connector task: the `preconnect`/`connect` handshake (§4.1).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::collector::client::CollectorClient;
use crate::collector::config::Config;
use crate::collector::wire::{parse_harvest_caps, ConnectPayload, ConnectReplyWire, RewriteRuleWire};
use crate::domain::agent_run::{AgentRun, HarvestCaps};
use crate::domain::attributes::DestinationFilter;
use crate::domain::rules::{RewriteRule, RuleSet};
use crate::domain_types::{ApdexThresholdSeconds, RunId};
use crate::error::CollectorError;
use crate::time_provider::SharedTimeProvider;

const INITIAL_BACKOFF: Duration = Duration::from_secs(15);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Drives the `preconnect` → `connect` handshake, retrying transient
/// failures with exponential back-off until a fatal error or a successful
/// [`AgentRun`] arrives.
#[derive(Debug)]
pub struct Connector {
    client: CollectorClient,
    config: Config,
    time: SharedTimeProvider,
}

impl Connector {
    #[must_use]
    pub fn new(config: Config, time: SharedTimeProvider) -> Self {
        Self {
            client: CollectorClient::new(),
            config,
            time,
        }
    }

    /// Runs the handshake loop, sending the eventual outcome on exactly one
    /// of `connected` or `connect_error`, then returning.
    #[instrument(skip(self, connected, connect_error), fields(app_name = %self.config.app_name))]
    pub async fn run(&self, pid: u32, connected: mpsc::Sender<AgentRun>, connect_error: mpsc::Sender<CollectorError>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.attempt(pid).await {
                Ok(run) => {
                    info!(run_id = %run.run_id, "connected to collector");
                    let _ = connected.send(run).await;
                    return;
                }
                Err(err) if err.is_terminal() => {
                    warn!(%err, "connect handshake failed fatally");
                    let _ = connect_error.send(err).await;
                    return;
                }
                Err(err) => {
                    warn!(%err, backoff_secs = backoff.as_secs(), "connect handshake failed, retrying");
                    self.time.sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Performs a single `preconnect`/`connect` attempt with no retry,
    /// returning the result directly. Used by the connectivity-probe CLI,
    /// where a caller wants an immediate answer rather than [`Connector::run`]'s
    /// indefinite backoff loop.
    ///
    /// # Errors
    ///
    /// Returns whatever [`CollectorError`] the handshake produced, terminal
    /// or transient alike.
    pub async fn probe(&self, pid: u32) -> Result<AgentRun, CollectorError> {
        self.attempt(pid).await
    }

    async fn attempt(&self, pid: u32) -> Result<AgentRun, CollectorError> {
        let preconnect_reply = self
            .client
            .invoke(&self.config.host, "preconnect", self.config.license_key.as_ref(), None, &[Value::Null])
            .await?;
        let redirect_host = preconnect_reply
            .get("redirect_host")
            .and_then(Value::as_str)
            .map_or_else(|| self.config.host.clone(), ToString::to_string);

        let default_caps = HarvestCaps::default();
        let payload = ConnectPayload::build(&self.config, pid, &default_caps);
        let body = serde_json::to_value(&payload).map_err(|e| CollectorError::Transient(e.to_string()))?;

        let reply_value = self
            .client
            .invoke(&redirect_host, "connect", self.config.license_key.as_ref(), None, &[body])
            .await?;
        let wire: ConnectReplyWire =
            serde_json::from_value(reply_value).map_err(|e| CollectorError::Transient(e.to_string()))?;

        build_agent_run(wire, redirect_host, &self.config)
    }
}

fn build_agent_run(wire: ConnectReplyWire, collector_host: String, config: &Config) -> Result<AgentRun, CollectorError> {
    let run_id = RunId::try_from(wire.agent_run_id)
        .map_err(|e| CollectorError::Transient(format!("collector returned an invalid agent_run_id: {e}")))?;
    let apdex_threshold_seconds = ApdexThresholdSeconds::try_new(wire.apdex_t).unwrap_or_default();

    let mut key_transactions = HashMap::new();
    for (name, threshold) in wire.key_transactions {
        if let Ok(threshold) = ApdexThresholdSeconds::try_new(threshold) {
            key_transactions.insert(name, threshold);
        }
    }

    Ok(AgentRun {
        run_id,
        collector_host,
        metric_rules: Arc::new(build_rule_set(wire.metric_name_rules)?),
        url_rules: Arc::new(build_rule_set(wire.url_rules)?),
        txn_name_rules: Arc::new(build_rule_set(wire.transaction_name_rules)?),
        segment_terms: Arc::new(build_rule_set(wire.transaction_segment_terms)?),
        harvest_caps: parse_harvest_caps(wire.agent_config.as_ref(), &HarvestCaps::default()),
        collect_traces: wire.collect_traces.unwrap_or(true),
        collect_errors: wire.collect_errors.unwrap_or(true),
        collect_error_events: wire.collect_error_events.unwrap_or(true),
        collect_analytics_events: wire.collect_analytics_events.unwrap_or(true),
        collect_custom_events: wire.collect_custom_events.unwrap_or(true),
        apdex_threshold_seconds,
        key_transactions,
        sampling_target: wire.sampling_target.unwrap_or(10),
        sampling_target_period_seconds: wire.sampling_target_period_in_seconds.unwrap_or(60),
        trusted_account_key: wire.trusted_account_key.unwrap_or_default(),
        security_policies_enabled: false,
        tracer_threshold: config.tracer_threshold,
        attribute_filter: Arc::new(DestinationFilter::permit_all()),
    })
}

fn build_rule_set(wire_rules: Vec<RewriteRuleWire>) -> Result<RuleSet, CollectorError> {
    let mut rules = Vec::with_capacity(wire_rules.len());
    for rule in wire_rules {
        let compiled = RewriteRule::new(
            &rule.match_expression,
            rule.replacement,
            rule.ignore,
            rule.terminate_chain,
            rule.each_segment,
            rule.eval_order,
        )
        .map_err(|e| CollectorError::Transient(format!("collector sent an unparseable rewrite rule: {e}")))?;
        rules.push(compiled);
    }
    Ok(RuleSet::new(rules))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{AppName, LicenseKey};
    use crate::time_provider::test_time_provider;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(host: String) -> Config {
        crate::collector::config::ConfigBuilder::new()
            .license_key("abcd1234")
            .app_name("test-app")
            .host(host)
            .build()
            .unwrap()
    }

    #[test]
    fn build_rule_set_compiles_wire_rules_in_order() {
        let wire = vec![RewriteRuleWire {
            match_expression: r"^/users/\d+$".to_string(),
            replacement: "/users/*".to_string(),
            ignore: false,
            terminate_chain: false,
            each_segment: false,
            eval_order: 0,
        }];
        let set = build_rule_set(wire).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn build_rule_set_rejects_an_unparseable_regex() {
        let wire = vec![RewriteRuleWire {
            match_expression: "[".to_string(),
            replacement: String::new(),
            ignore: false,
            terminate_chain: false,
            each_segment: false,
            eval_order: 0,
        }];
        assert!(build_rule_set(wire).is_err());
    }

    #[test]
    fn build_agent_run_falls_back_to_default_apdex_on_bad_server_value() {
        let wire = ConnectReplyWire {
            agent_run_id: "run-1".to_string(),
            metric_name_rules: Vec::new(),
            url_rules: Vec::new(),
            transaction_name_rules: Vec::new(),
            transaction_segment_terms: Vec::new(),
            apdex_t: -1.0,
            collect_traces: None,
            collect_errors: None,
            collect_error_events: None,
            collect_analytics_events: None,
            collect_custom_events: None,
            sampling_target: None,
            sampling_target_period_in_seconds: None,
            trusted_account_key: None,
            key_transactions: std::collections::BTreeMap::new(),
            agent_config: None,
        };
        let config = test_config("collector.example.com".to_string());
        let run = build_agent_run(wire, "collector.example.com".to_string(), &config).unwrap();
        assert_eq!(run.apdex_threshold_seconds, ApdexThresholdSeconds::default());
    }

    #[tokio::test]
    async fn successful_handshake_sends_an_agent_run_on_connected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent_listener/invoke_raw_method"))
            .and(query_param("method", "preconnect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "return_value": { "redirect_host": server.address().to_string() }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/agent_listener/invoke_raw_method"))
            .and(query_param("method", "connect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "return_value": { "agent_run_id": "run-42", "apdex_t": 0.25 }
            })))
            .mount(&server)
            .await;

        let connector = Connector::new(test_config(server.uri()), test_time_provider());
        let (connected_tx, mut connected_rx) = mpsc::channel(1);
        let (error_tx, _error_rx) = mpsc::channel(1);
        connector.run(1234, connected_tx, error_tx).await;

        let run = connected_rx.recv().await.unwrap();
        assert_eq!(run.run_id.to_string(), "run-42");
    }

    #[tokio::test]
    async fn invalid_license_status_is_reported_as_a_fatal_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent_listener/invoke_raw_method"))
            .and(query_param("method", "preconnect"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let connector = Connector::new(test_config(server.uri()), test_time_provider());
        let (connected_tx, _connected_rx) = mpsc::channel(1);
        let (error_tx, mut error_rx) = mpsc::channel(1);
        connector.run(1234, connected_tx, error_tx).await;

        assert_eq!(error_rx.recv().await, Some(CollectorError::InvalidLicense));
    }

    #[test]
    fn config_license_key_and_app_name_survive_the_builder() {
        let config = test_config("collector.example.com".to_string());
        assert_eq!(config.app_name, AppName::try_new("test-app").unwrap());
        assert_eq!(config.license_key, LicenseKey::try_new("abcd1234").unwrap());
    }
}
