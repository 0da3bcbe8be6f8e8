//! `AgentRun`: the immutable reply from a successful connect (§3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::attributes::DestinationFilter;
use crate::domain::rules::RuleSet;
use crate::domain_types::{ApdexThresholdSeconds, ReservoirCapacity, RunId};

/// Per-event-kind harvest caps, as returned by the collector's
/// `event_harvest_config` (§3, §6).
#[derive(Debug, Clone)]
pub struct HarvestCaps {
    pub analytic_event_data: ReservoirCapacity,
    pub custom_event_data: ReservoirCapacity,
    pub error_event_data: ReservoirCapacity,
    pub span_event_data: ReservoirCapacity,
}

impl Default for HarvestCaps {
    fn default() -> Self {
        Self {
            analytic_event_data: ReservoirCapacity::try_new(10_000).unwrap(),
            custom_event_data: ReservoirCapacity::try_new(10_000).unwrap(),
            error_event_data: ReservoirCapacity::try_new(100).unwrap(),
            span_event_data: ReservoirCapacity::try_new(1_000).unwrap(),
        }
    }
}

/// The immutable reply from a successful connect handshake.
///
/// Referenced by many transactions concurrently; replaced atomically on
/// reconnect by [`crate::processor::lifecycle_manager::HarvestProcessor`]. Never
/// mutated in place — every config change arrives as a brand new `AgentRun`.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub run_id: RunId,
    pub collector_host: String,
    pub metric_rules: Arc<RuleSet>,
    pub url_rules: Arc<RuleSet>,
    pub txn_name_rules: Arc<RuleSet>,
    pub segment_terms: Arc<RuleSet>,
    pub harvest_caps: HarvestCaps,
    pub collect_traces: bool,
    pub collect_errors: bool,
    pub collect_error_events: bool,
    pub collect_analytics_events: bool,
    pub collect_custom_events: bool,
    pub apdex_threshold_seconds: ApdexThresholdSeconds,
    pub key_transactions: HashMap<String, ApdexThresholdSeconds>,
    pub sampling_target: u64,
    pub sampling_target_period_seconds: u64,
    pub trusted_account_key: String,
    pub security_policies_enabled: bool,
    /// Locally configured transaction-trace duration threshold, carried over
    /// from `Config` at connect time (§4.3 "Trace bucket").
    pub tracer_threshold: Duration,
    /// Destination/attribute inclusion rules applied before an attribute is
    /// attached to any outbound payload (§4.4).
    pub attribute_filter: Arc<DestinationFilter>,
}

impl AgentRun {
    /// The apdex threshold for `transaction_name`: the server-supplied
    /// per-key-transaction value if one exists, otherwise the default (§4.2).
    #[must_use]
    pub fn apdex_threshold_for(&self, transaction_name: &str) -> ApdexThresholdSeconds {
        self.key_transactions
            .get(transaction_name)
            .copied()
            .unwrap_or(self.apdex_threshold_seconds)
    }

    /// The transaction-trace duration threshold for `transaction_name`: the
    /// larger of the locally configured `tracerThreshold.duration` and
    /// `4 x apdexThreshold` (§4.3 "Trace bucket").
    #[must_use]
    pub fn trace_threshold_for(&self, transaction_name: &str) -> Duration {
        let apdex_based = Duration::from_secs_f64(self.apdex_threshold_for(transaction_name).into_inner() * 4.0);
        self.tracer_threshold.max(apdex_based)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_run() -> AgentRun {
        AgentRun {
            run_id: RunId::try_from("run-1".to_string()).unwrap(),
            collector_host: "collector.example.com".to_string(),
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

    #[test]
    fn falls_back_to_default_threshold_for_unknown_names() {
        let run = sample_run();
        assert_eq!(
            run.apdex_threshold_for("unknown"),
            ApdexThresholdSeconds::default()
        );
    }

    #[test]
    fn uses_key_transaction_threshold_when_present() {
        let mut run = sample_run();
        let custom = ApdexThresholdSeconds::try_new(2.0).unwrap();
        run.key_transactions.insert("important".to_string(), custom);
        assert_eq!(run.apdex_threshold_for("important"), custom);
    }

    #[test]
    fn trace_threshold_uses_the_larger_of_tracer_threshold_and_four_times_apdex() {
        let mut run = sample_run();
        run.apdex_threshold_seconds = ApdexThresholdSeconds::try_new(0.1).unwrap();
        run.tracer_threshold = Duration::from_secs(5);
        assert_eq!(run.trace_threshold_for("unknown"), Duration::from_secs(5));

        run.tracer_threshold = Duration::from_millis(50);
        assert_eq!(run.trace_threshold_for("unknown"), Duration::from_millis(400));
    }
}
