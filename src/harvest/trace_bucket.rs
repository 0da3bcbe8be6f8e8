//! Transaction trace bucket: the slowest trace this interval, plus one trace
//! per key transaction (§4.3 "Trace bucket").

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::attributes::AttributeValue;
use crate::domain::segment::{Segment, SegmentTracer};
use crate::domain_types::{AttributeKey, SegmentToken};

/// One node of a serialized segment tree: depth-first, millisecond offsets
/// relative to the owning transaction's start (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceNode {
    pub name: String,
    pub start_offset_ms: u64,
    pub end_offset_ms: u64,
    pub attributes: Vec<(AttributeKey, AttributeValue)>,
    pub children: Vec<TraceNode>,
}

/// A captured transaction trace, ready for compressed-JSON serialization at
/// the collector-client boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionTrace {
    pub transaction_name: String,
    pub duration: Duration,
    pub root_nodes: Vec<TraceNode>,
}

fn build_node(tracer: &SegmentTracer, token: SegmentToken, txn_start: std::time::Instant) -> Option<TraceNode> {
    let segment: &Segment = tracer.get(token)?;
    let stop = segment.stop?;
    let start_offset_ms = segment.start.saturating_duration_since(txn_start).as_millis() as u64;
    let end_offset_ms = stop.saturating_duration_since(txn_start).as_millis() as u64;
    let name = segment
        .kind
        .as_ref()
        .map(crate::domain::segment::SegmentKind::metric_name_fragment)
        .unwrap_or_else(|| "Unknown".to_string());
    let children = segment
        .children
        .iter()
        .filter_map(|&child| build_node(tracer, child, txn_start))
        .collect();
    Some(TraceNode {
        name,
        start_offset_ms,
        end_offset_ms,
        attributes: Vec::new(),
        children,
    })
}

impl TransactionTrace {
    /// Builds a trace from a transaction's segment tracer, walking the tree
    /// depth-first from its root segments.
    #[must_use]
    pub fn from_tracer(
        transaction_name: impl Into<String>,
        duration: Duration,
        tracer: &SegmentTracer,
        txn_start: std::time::Instant,
    ) -> Self {
        let root_nodes = tracer
            .roots()
            .into_iter()
            .filter_map(|token| build_node(tracer, token, txn_start))
            .collect();
        Self {
            transaction_name: transaction_name.into(),
            duration,
            root_nodes,
        }
    }
}

/// Holds at most one "slowest trace this interval" plus one trace per
/// key-transaction name. Newer wins ties at equal duration (§4.3).
#[derive(Debug, Clone, Default)]
pub struct TraceBucket {
    slowest: Option<TransactionTrace>,
    key_transaction_traces: BTreeMap<String, TransactionTrace>,
}

impl TraceBucket {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers a candidate trace. `threshold` is the larger of the tracer's
    /// configured duration threshold and 4x the apdex threshold. `is_key_transaction`
    /// routes the trace into its own per-name slot instead of (or in addition
    /// to) the general slowest-trace slot.
    pub fn offer(&mut self, trace: TransactionTrace, threshold: Duration, is_key_transaction: bool) {
        if is_key_transaction {
            self.key_transaction_traces
                .insert(trace.transaction_name.clone(), trace.clone());
        }
        if trace.duration < threshold {
            return;
        }
        let replace = match &self.slowest {
            None => true,
            Some(current) => trace.duration >= current.duration,
        };
        if replace {
            self.slowest = Some(trace);
        }
    }

    /// The slowest trace retained this interval, if any exceeded threshold.
    #[must_use]
    pub fn slowest(&self) -> Option<&TransactionTrace> {
        self.slowest.as_ref()
    }

    /// Traces retained because they belong to a key transaction.
    pub fn key_transaction_traces(&self) -> impl Iterator<Item = &TransactionTrace> {
        self.key_transaction_traces.values()
    }

    /// Merges another bucket's contents into this one on a failed harvest,
    /// keeping the slower/newer trace per slot.
    pub fn merge(&mut self, other: Self, threshold: Duration) {
        if let Some(trace) = other.slowest {
            self.offer(trace, threshold, false);
        }
        for (name, trace) in other.key_transaction_traces {
            self.key_transaction_traces.entry(name).or_insert(trace);
        }
    }

    /// Whether the bucket holds no traces at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slowest.is_none() && self.key_transaction_traces.is_empty()
    }
}
