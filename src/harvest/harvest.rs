//! The top-level per-interval aggregate tying together every aggregator kind
//! (§3 Harvest, §4.3).

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use tracing::trace;

use crate::domain::agent_run::AgentRun;
use crate::domain::apdex::ApdexZone;
use crate::domain::attributes::{AttributeValue, Destination, DestinationFilter};
use crate::domain::rules::RuleOutcome;
use crate::domain::transaction::EndedTransaction;
use crate::domain_types::{AttributeKey, MetricName, MetricScope, Priority};

use super::error_trace_set::ErrorTraceSet;
use super::metrics_table::MetricsTable;
use super::reservoir::Reservoir;
use super::slow_query_set::SlowQuerySet;
use super::trace_bucket::{TraceBucket, TransactionTrace};

/// Wire identifier for the host application's instrumentation language.
/// Fixed at `"go"` for bit-level compatibility with the collector's existing
/// event-shape validation (§6 "Wire shape... bit-level compatibility matters").
pub const AGENT_LANGUAGE: &str = "go";

/// One retained transaction (analytic) event.
#[derive(Debug, Clone)]
pub struct TxnEvent {
    pub name: String,
    pub duration: Duration,
    pub apdex_zone: ApdexZone,
    pub response_code: Option<u16>,
    pub is_web: bool,
    pub agent_attributes: Vec<(AttributeKey, AttributeValue)>,
    pub user_attributes: Vec<(AttributeKey, AttributeValue)>,
}

/// One retained error event.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub transaction_name: String,
    pub class: String,
    pub message: String,
    pub when: SystemTime,
}

/// One retained custom event, recorded via the host application's own API.
#[derive(Debug, Clone)]
pub struct CustomEvent {
    pub event_type: String,
    pub attributes: BTreeMap<AttributeKey, AttributeValue>,
    pub when: SystemTime,
}

/// One retained span event, derived from a single ended segment.
#[derive(Debug, Clone)]
pub struct SpanEvent {
    pub name: String,
    pub duration: Duration,
    pub transaction_name: String,
}

fn metric_name(s: impl Into<String>) -> MetricName {
    MetricName::try_new(s.into()).expect("harvest-generated metric names are always non-empty and short")
}

/// Keeps only the attributes `filter` allows through to `destination` (§4.4).
fn filter_attrs(
    attrs: &[(AttributeKey, AttributeValue)],
    filter: &DestinationFilter,
    destination: Destination,
) -> Vec<(AttributeKey, AttributeValue)> {
    attrs
        .iter()
        .filter(|(key, _)| filter.allows(&key.to_string(), destination))
        .cloned()
        .collect()
}

/// One reporting interval's worth of aggregated telemetry.
///
/// Exactly one owner thread (the Harvest Processor) ever mutates a `Harvest`
/// (§4.1, §5); every method here takes `&mut self` accordingly and performs
/// no locking of its own.
#[derive(Debug, Clone)]
pub struct Harvest {
    pub begin: SystemTime,
    pub metrics: MetricsTable,
    pub txn_events: Reservoir<TxnEvent>,
    pub custom_events: Reservoir<CustomEvent>,
    pub error_events: Reservoir<ErrorEvent>,
    pub span_events: Reservoir<SpanEvent>,
    pub traces: TraceBucket,
    pub error_traces: ErrorTraceSet,
    pub slow_queries: SlowQuerySet,
}

impl Harvest {
    /// Starts a fresh, empty harvest sized by the given `AgentRun`'s caps.
    #[must_use]
    pub fn new(agent_run: &AgentRun, begin: SystemTime) -> Self {
        Self {
            begin,
            metrics: MetricsTable::new(),
            txn_events: Reservoir::new(agent_run.harvest_caps.analytic_event_data),
            custom_events: Reservoir::new(agent_run.harvest_caps.custom_event_data),
            error_events: Reservoir::new(agent_run.harvest_caps.error_event_data),
            span_events: Reservoir::new(agent_run.harvest_caps.span_event_data),
            traces: TraceBucket::new(),
            error_traces: ErrorTraceSet::new(),
            slow_queries: SlowQuerySet::new(),
        }
    }

    /// Whether this harvest has nothing worth delivering.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
            && self.txn_events.is_empty()
            && self.custom_events.is_empty()
            && self.error_events.is_empty()
            && self.span_events.is_empty()
            && self.traces.is_empty()
            && self.error_traces.is_empty()
            && self.slow_queries.is_empty()
    }

    /// Folds one ended transaction into this harvest: rollup metrics, apdex
    /// metrics, the transaction event, error metrics/events/traces, and (if
    /// it is slow enough) a transaction trace (§4.3, §8 scenarios 1-2).
    pub fn record_ended_transaction(&mut self, txn: &EndedTransaction, agent_run: &AgentRun) {
        let scoped_name = format!(
            "{}/{AGENT_LANGUAGE}/{}",
            if txn.is_web { "WebTransaction" } else { "OtherTransaction" },
            txn.name
        );
        self.metrics
            .record(metric_name(scoped_name.clone()), MetricScope::unscoped(), txn.duration, txn.exclusive_duration);

        if txn.is_web {
            self.metrics.record(metric_name("WebTransaction"), MetricScope::unscoped(), txn.duration, txn.exclusive_duration);
            self.metrics.record(metric_name("HttpDispatcher"), MetricScope::unscoped(), txn.duration, txn.exclusive_duration);
            self.metrics.record_apdex(metric_name("Apdex"), txn.apdex_zone);
            self.metrics
                .record_apdex(metric_name(format!("Apdex/{AGENT_LANGUAGE}/{}", txn.name)), txn.apdex_zone);
        } else {
            self.metrics.record(metric_name("OtherTransaction/all"), MetricScope::unscoped(), txn.duration, txn.exclusive_duration);
        }

        if !txn.errors.is_empty() {
            self.metrics.record(metric_name("Errors/all"), MetricScope::unscoped(), Duration::ZERO, Duration::ZERO);
            self.metrics.record(
                metric_name(if txn.is_web { "Errors/allWeb" } else { "Errors/allOther" }),
                MetricScope::unscoped(),
                Duration::ZERO,
                Duration::ZERO,
            );
            self.metrics
                .record(metric_name(format!("Errors/{scoped_name}")), MetricScope::unscoped(), Duration::ZERO, Duration::ZERO);

            for error in &txn.errors {
                self.error_events.insert(
                    txn.priority,
                    ErrorEvent {
                        transaction_name: scoped_name.clone(),
                        class: error.class.clone(),
                        message: error.message.clone(),
                        when: error.when,
                    },
                );
                self.error_traces.push(error.clone());
            }
        }

        self.txn_events.insert(
            txn.priority,
            TxnEvent {
                name: scoped_name.clone(),
                duration: txn.duration,
                apdex_zone: txn.apdex_zone,
                response_code: txn.response_code,
                is_web: txn.is_web,
                agent_attributes: filter_attrs(&txn.agent_attributes, &agent_run.attribute_filter, Destination::TxnEvents),
                user_attributes: filter_attrs(&txn.user_attributes, &agent_run.attribute_filter, Destination::TxnEvents),
            },
        );

        let is_key_transaction = agent_run.key_transactions.contains_key(&txn.name);
        let trace_threshold = agent_run.trace_threshold_for(&txn.name);
        trace!(transaction = %scoped_name, duration_ms = txn.duration.as_millis(), "considering transaction for trace bucket");
        self.record_trace(txn.trace.clone(), trace_threshold, is_key_transaction);

        for candidate in &txn.slow_queries {
            self.slow_queries.record(
                candidate.fingerprint.clone(),
                candidate.duration,
                candidate.sample_query.clone(),
                candidate.sample_params.clone(),
            );
        }
    }

    /// Records a custom event reported via the host application's API.
    pub fn record_custom_event(&mut self, event_type: impl Into<String>, attributes: BTreeMap<AttributeKey, AttributeValue>, priority: Priority, when: SystemTime) {
        self.custom_events.insert(
            priority,
            CustomEvent {
                event_type: event_type.into(),
                attributes,
                when,
            },
        );
    }

    /// Offers a fully-built transaction trace into the trace bucket.
    pub fn record_trace(&mut self, trace: TransactionTrace, threshold: Duration, is_key_transaction: bool) {
        self.traces.offer(trace, threshold, is_key_transaction);
    }

    /// Records a forced sample metric (e.g. from the runtime sampler), always
    /// kept regardless of rewrite rules (§4.3 "forced metrics").
    pub fn record_forced_metric(&mut self, name: &str, value: f64) {
        let forced = MetricName::try_new(name).expect("forced metric names are static and valid");
        self.metrics.record(forced, MetricScope::unscoped(), Duration::from_secs_f64(value), Duration::ZERO);
    }

    /// Applies a metric-rename rule to a metric name before recording,
    /// dropping it entirely when the rule says to ignore it (§4.2 "Metric
    /// rules application").
    pub fn record_ruled_metric(&mut self, raw_name: &str, rules: &crate::domain::rules::RuleSet, elapsed: Duration, exclusive: Duration, forced: bool) {
        match rules.apply(raw_name) {
            RuleOutcome::Kept(name) => {
                self.metrics.record(metric_name(name), MetricScope::unscoped(), elapsed, exclusive);
            }
            RuleOutcome::Ignored if forced => {
                self.metrics.record(metric_name(raw_name), MetricScope::unscoped(), elapsed, exclusive);
            }
            RuleOutcome::Ignored => {}
        }
    }

    /// Merges `other` (an undelivered harvest) into `self`, the current
    /// harvest, after a failed delivery (§4.1 "merge-back", §8 scenario 5).
    pub fn merge_failed(&mut self, other: Self, trace_threshold: Duration) {
        self.metrics.merge(other.metrics);
        self.txn_events.merge(other.txn_events);
        self.custom_events.merge(other.custom_events);
        self.error_events.merge(other.error_events);
        self.span_events.merge(other.span_events);
        self.traces.merge(other.traces, trace_threshold);
        self.error_traces.merge(other.error_traces);
        self.slow_queries.merge(other.slow_queries);
    }
}
