//! Collector wire shapes: connect payload, metric/event payload encoders,
//! and the response envelope (§4.5, §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::collector::config::Config;
use crate::collector::utilization::Utilization;
use crate::domain::agent_run::HarvestCaps;
use crate::domain::attributes::AttributeValue;
use crate::domain_types::{AttributeKey, MetricName, MetricScope, ReservoirCapacity, RunId};
use crate::harvest::harvest::AGENT_LANGUAGE;
use crate::harvest::metrics_table::MetricValue;

/// Crate version reported as `agent_version` on the wire.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The single object wrapped in a one-element JSON array for `connect` (§6).
#[derive(Debug, Clone, Serialize)]
pub struct ConnectPayload {
    pub pid: u32,
    pub language: &'static str,
    pub agent_version: &'static str,
    pub host: String,
    pub settings: BTreeMap<String, Value>,
    pub app_name: Vec<String>,
    pub high_security: bool,
    pub labels: Vec<LabelPair>,
    pub environment: Vec<Value>,
    pub identifier: String,
    pub utilization: Utilization,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_policies: Option<BTreeMap<String, Value>>,
    pub metadata: BTreeMap<String, String>,
    pub event_harvest_config: EventHarvestConfigWire,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_host: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelPair {
    pub label_type: String,
    pub label_value: String,
}

/// Server-facing encoding of the default event-reservoir caps this agent
/// requests (the server may override them in its reply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHarvestConfigWire {
    pub report_period_ms: u64,
    pub harvest_limits: BTreeMap<String, usize>,
}

impl From<&HarvestCaps> for EventHarvestConfigWire {
    fn from(caps: &HarvestCaps) -> Self {
        let mut harvest_limits = BTreeMap::new();
        harvest_limits.insert("analytic_event_data".to_string(), caps.analytic_event_data.as_usize());
        harvest_limits.insert("custom_event_data".to_string(), caps.custom_event_data.as_usize());
        harvest_limits.insert("error_event_data".to_string(), caps.error_event_data.as_usize());
        harvest_limits.insert("span_event_data".to_string(), caps.span_event_data.as_usize());
        Self {
            report_period_ms: 60_000,
            harvest_limits,
        }
    }
}

impl ConnectPayload {
    /// Builds the connect payload from resolved config and a fresh
    /// utilization probe.
    #[must_use]
    pub fn build(config: &Config, pid: u32, default_caps: &HarvestCaps) -> Self {
        Self {
            pid,
            language: AGENT_LANGUAGE,
            agent_version: AGENT_VERSION,
            host: config.host.clone(),
            settings: BTreeMap::new(),
            app_name: vec![config.app_name.to_string()],
            high_security: config.high_security,
            labels: config
                .labels
                .iter()
                .map(|(k, v)| LabelPair {
                    label_type: k.clone(),
                    label_value: v.clone(),
                })
                .collect(),
            environment: Vec::new(),
            identifier: config.app_name.to_string(),
            utilization: Utilization::probe(),
            security_policies: None,
            metadata: config.metadata.clone(),
            event_harvest_config: EventHarvestConfigWire::from(default_caps),
            display_host: config.process_host_display_name.clone(),
        }
    }
}

/// One metric entry as sent in `metric_data`: `[{name, scope}, [count, total, exclusive, min, max, sumSquares]]`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricDataEntry(pub MetricNameScope, pub [f64; 6]);

#[derive(Debug, Clone, Serialize)]
pub struct MetricNameScope {
    pub name: String,
    pub scope: String,
}

/// Builds the `metric_data` wire array: `[agentRunId, beginEpoch, endEpoch, entries]`.
#[must_use]
pub fn metric_data_payload(
    run_id: &RunId,
    begin_epoch_secs: f64,
    end_epoch_secs: f64,
    metrics: impl Iterator<Item = ((MetricName, MetricScope), MetricValue)>,
) -> Value {
    let entries: Vec<MetricDataEntry> = metrics
        .map(|((name, scope), value)| {
            MetricDataEntry(
                MetricNameScope {
                    name: name.to_string(),
                    scope: scope.to_string(),
                },
                [
                    value.count as f64,
                    value.total,
                    value.exclusive,
                    value.min,
                    value.max,
                    value.sum_of_squares,
                ],
            )
        })
        .collect();
    serde_json::json!([run_id.to_string(), begin_epoch_secs, end_epoch_secs, entries])
}

/// One analytic/error/custom/span event: `[intrinsics, userAttributes, agentAttributes]`.
#[must_use]
pub fn event_triplet(
    intrinsics: BTreeMap<String, Value>,
    user_attributes: &[(AttributeKey, AttributeValue)],
    agent_attributes: &[(AttributeKey, AttributeValue)],
) -> Value {
    serde_json::json!([
        intrinsics,
        attribute_map(user_attributes),
        attribute_map(agent_attributes),
    ])
}

fn attribute_map(attrs: &[(AttributeKey, AttributeValue)]) -> BTreeMap<String, AttributeValue> {
    attrs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Builds an event-kind wire payload: `[agentRunId, {reservoir_size, events_seen}, events]`.
#[must_use]
pub fn event_payload(run_id: &RunId, reservoir_size: usize, events_seen: u64, events: Vec<Value>) -> Value {
    serde_json::json!([
        run_id.to_string(),
        { "reservoir_size": reservoir_size, "events_seen": events_seen },
        events,
    ])
}

/// The subset of a `connect` reply this agent actually consumes. Every field
/// falls back to a sensible default when the server omits it, since the real
/// wire shape carries many more backend-specific keys than the core needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectReplyWire {
    pub agent_run_id: String,
    #[serde(default)]
    pub metric_name_rules: Vec<RewriteRuleWire>,
    #[serde(default)]
    pub url_rules: Vec<RewriteRuleWire>,
    #[serde(default)]
    pub transaction_name_rules: Vec<RewriteRuleWire>,
    #[serde(default)]
    pub transaction_segment_terms: Vec<RewriteRuleWire>,
    #[serde(default = "default_apdex_t")]
    pub apdex_t: f64,
    #[serde(default)]
    pub collect_traces: Option<bool>,
    #[serde(default)]
    pub collect_errors: Option<bool>,
    #[serde(default)]
    pub collect_error_events: Option<bool>,
    #[serde(default)]
    pub collect_analytics_events: Option<bool>,
    #[serde(default)]
    pub collect_custom_events: Option<bool>,
    #[serde(default)]
    pub sampling_target: Option<u64>,
    #[serde(default)]
    pub sampling_target_period_in_seconds: Option<u64>,
    #[serde(default)]
    pub trusted_account_key: Option<String>,
    #[serde(default)]
    pub key_transactions: BTreeMap<String, f64>,
    #[serde(default)]
    pub agent_config: Option<Value>,
}

fn default_apdex_t() -> f64 {
    0.5
}

/// Reads `event_harvest_config.harvest_limits` out of a connect reply's
/// free-form `agent_config` blob, falling back to `default` per-key when the
/// server omits a key or sends a value that doesn't fit a [`ReservoirCapacity`].
#[must_use]
pub fn parse_harvest_caps(agent_config: Option<&Value>, default: &HarvestCaps) -> HarvestCaps {
    let limits = agent_config
        .and_then(|v| v.get("event_harvest_config"))
        .and_then(|v| v.get("harvest_limits"))
        .and_then(Value::as_object);

    let cap_for = |key: &str, fallback: ReservoirCapacity| -> ReservoirCapacity {
        limits
            .and_then(|limits| limits.get(key))
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .and_then(|n| ReservoirCapacity::try_new(n).ok())
            .unwrap_or(fallback)
    };

    HarvestCaps {
        analytic_event_data: cap_for("analytic_event_data", default.analytic_event_data),
        custom_event_data: cap_for("custom_event_data", default.custom_event_data),
        error_event_data: cap_for("error_event_data", default.error_event_data),
        span_event_data: cap_for("span_event_data", default.span_event_data),
    }
}

/// One rewrite rule as sent down on connect, matching `RewriteRule::new`'s
/// arguments one-for-one.
#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRuleWire {
    pub match_expression: String,
    #[serde(default)]
    pub replacement: String,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub terminate_chain: bool,
    #[serde(default)]
    pub each_segment: bool,
    #[serde(default)]
    pub eval_order: i32,
}

/// The collector's reply envelope: either a success payload or a structured
/// exception (§4.5, §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResponseEnvelope {
    Success { return_value: Value },
    Exception { exception: ExceptionBody },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExceptionBody {
    pub message: String,
    pub error_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_envelope_parses_success() {
        let parsed: ResponseEnvelope = serde_json::from_str(r#"{"return_value": {"agent_run_id": "abc"}}"#).unwrap();
        assert!(matches!(parsed, ResponseEnvelope::Success { .. }));
    }

    #[test]
    fn response_envelope_parses_exception() {
        let parsed: ResponseEnvelope =
            serde_json::from_str(r#"{"exception": {"message": "bad license", "error_type": "NewRelic::Agent::LicenseException"}}"#).unwrap();
        match parsed {
            ResponseEnvelope::Exception { exception } => assert_eq!(exception.message, "bad license"),
            ResponseEnvelope::Success { .. } => panic!("expected exception"),
        }
    }

    #[test]
    fn metric_data_payload_shape_matches_wire_contract() {
        let run_id = RunId::try_from("run-1".to_string()).unwrap();
        let mut table = crate::harvest::metrics_table::MetricsTable::new();
        table.record(
            MetricName::try_new("Custom/x").unwrap(),
            MetricScope::unscoped(),
            std::time::Duration::from_millis(10),
            std::time::Duration::from_millis(10),
        );
        let payload = metric_data_payload(
            &run_id,
            0.0,
            60.0,
            table.iter().map(|(k, v)| (k.clone(), *v)),
        );
        let array = payload.as_array().unwrap();
        assert_eq!(array.len(), 4);
        assert_eq!(array[0], serde_json::json!("run-1"));
    }
}
