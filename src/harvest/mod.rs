//! Harvest aggregators: everything folded into one reporting interval (§4.3).

pub mod error_trace_set;
pub mod harvest;
pub mod metrics_table;
pub mod reservoir;
pub mod slow_query_set;
pub mod trace_bucket;

pub use error_trace_set::ErrorTraceSet;
pub use harvest::{CustomEvent, ErrorEvent, Harvest, SpanEvent, TxnEvent, AGENT_LANGUAGE};
pub use metrics_table::{MetricValue, MetricsTable};
pub use reservoir::Reservoir;
pub use slow_query_set::{SlowQueryStats, SlowQuerySet};
pub use trace_bucket::{TraceBucket, TraceNode, TransactionTrace};
