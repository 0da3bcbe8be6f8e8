#![allow(missing_docs)]

pub mod agent_run;
pub mod apdex;
pub mod attributes;
pub mod captured_error;
pub mod dt_payload;
pub mod rules;
pub mod segment;
pub mod transaction;

pub use agent_run::{AgentRun, HarvestCaps};
pub use apdex::ApdexZone;
pub use attributes::{AttributeStore, AttributeValue, Destination, DestinationFilter};
pub use captured_error::{CapturedError, ErrorRing};
pub use dt_payload::{DistributedTracePayload, DistributedTracePayloadData, DtPayloadError};
pub use rules::{RewriteRule, RuleOutcome, RuleSet};
pub use segment::{DatastoreInfo, ExternalInfo, MessageInfo, Segment, SegmentKind, SegmentTracer};
pub use transaction::{EndedTransaction, Transaction, WebRequestInfo};
