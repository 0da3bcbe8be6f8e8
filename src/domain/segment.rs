//! Segment tree: timed intervals nested within a transaction (§3 Segment, §9).
//!
//! Segments are stored in a flat slab indexed by [`crate::domain_types::SegmentToken`]
//! rather than linked through parent pointers, so the tree can never become cyclic
//! and nodes can be addressed by a plain integer handed back to host code.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::domain_types::SegmentToken;

/// Structured fields recorded for a datastore segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatastoreInfo {
    /// Product name, e.g. `"Postgres"`.
    pub product: String,
    /// Collection/table operated on, if known.
    pub collection: Option<String>,
    /// Operation performed, e.g. `"select"`.
    pub operation: Option<String>,
    /// Host the query ran against.
    pub host: Option<String>,
    /// Port the query ran against.
    pub port: Option<u16>,
    /// Database name.
    pub database: Option<String>,
    /// Parameterized query text, if the caller supplied one. Feeds the
    /// slow-query set when the segment's duration is at or above
    /// [`crate::harvest::slow_query_set::EXPLICIT_DURATION_THRESHOLD`].
    pub query: Option<String>,
}

/// Structured fields recorded for an external-call segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalInfo {
    /// Host contacted.
    pub host: String,
    /// HTTP method, when applicable.
    pub method: Option<String>,
}

/// Structured fields recorded for a message-queue segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageInfo {
    /// Messaging library, e.g. `"RabbitMQ"`.
    pub library: String,
    /// Destination queue/topic name.
    pub destination: String,
}

/// The kind of work a segment represents, with its kind-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SegmentKind {
    /// A plain named segment with no structured fields.
    Basic { name: String },
    /// A datastore call.
    Datastore(DatastoreInfo),
    /// An external HTTP call.
    External(ExternalInfo),
    /// A message-queue publish/consume.
    Message(MessageInfo),
}

impl SegmentKind {
    /// The metric-name fragment this segment kind contributes, independent of nesting.
    #[must_use]
    pub fn metric_name_fragment(&self) -> String {
        match self {
            Self::Basic { name } => format!("Custom/{name}"),
            Self::Datastore(info) => {
                let product = &info.product;
                match (&info.collection, &info.operation) {
                    (Some(collection), Some(op)) => {
                        format!("Datastore/statement/{product}/{collection}/{op}")
                    }
                    _ => format!("Datastore/operation/{product}/unknown"),
                }
            }
            Self::External(info) => format!("External/{}/all", info.host),
            Self::Message(info) => format!("MessageBroker/{}/{}", info.library, info.destination),
        }
    }
}

/// One node in a transaction's segment tree.
///
/// `start`/`stop` are captured with [`Instant`] for duration arithmetic; wall-clock
/// timestamps for the trace payload are derived by the owning [`super::transaction::Transaction`]
/// at encode time relative to its own start time.
#[derive(Debug, Clone)]
pub struct Segment {
    pub(crate) kind: Option<SegmentKind>,
    pub(crate) start: Instant,
    pub(crate) stop: Option<Instant>,
    pub(crate) parent: Option<SegmentToken>,
    pub(crate) children: Vec<SegmentToken>,
}

impl Segment {
    fn open(start: Instant, parent: Option<SegmentToken>) -> Self {
        Self {
            kind: None,
            start,
            stop: None,
            parent,
            children: Vec::new(),
        }
    }

    /// Wall-clock duration of this segment. `None` until the segment is ended.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.stop.map(|stop| stop.saturating_duration_since(self.start))
    }

    /// Whether the segment has been ended.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.stop.is_some()
    }
}

/// The slab of segments belonging to a single transaction, plus the set of
/// currently-open (un-ended) tokens.
#[derive(Debug, Clone, Default)]
pub struct SegmentTracer {
    slab: Vec<Segment>,
    next_token: u64,
}

impl SegmentTracer {
    /// Creates an empty tracer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new segment, nested under `parent` (or a root segment if `None`).
    pub fn start_segment(&mut self, now: Instant, parent: Option<SegmentToken>) -> SegmentToken {
        let token = SegmentToken::new(self.next_token);
        self.next_token += 1;
        self.slab.push(Segment::open(now, parent));
        if let Some(parent) = parent {
            if let Some(parent_segment) = self.get_mut(parent) {
                parent_segment.children.push(token);
            }
        }
        token
    }

    fn index_of(&self, token: SegmentToken) -> Option<usize> {
        usize::try_from(token.into_inner()).ok()
    }

    fn get_mut(&mut self, token: SegmentToken) -> Option<&mut Segment> {
        let idx = self.index_of(token)?;
        self.slab.get_mut(idx)
    }

    /// Returns the segment for `token`, if it exists in this tracer.
    #[must_use]
    pub fn get(&self, token: SegmentToken) -> Option<&Segment> {
        let idx = self.index_of(token)?;
        self.slab.get(idx)
    }

    /// Ends a segment with the given kind. Unknown tokens and already-ended
    /// segments are defined to be no-ops (§4.2).
    pub fn end_segment(&mut self, token: SegmentToken, now: Instant, kind: SegmentKind) {
        if let Some(segment) = self.get_mut(token) {
            if segment.stop.is_none() {
                segment.stop = Some(now);
                segment.kind = Some(kind);
            }
        }
    }

    /// All root-level (no parent) segment tokens, in creation order.
    #[must_use]
    pub fn roots(&self) -> Vec<SegmentToken> {
        self.slab
            .iter()
            .enumerate()
            .filter(|(_, s)| s.parent.is_none())
            .map(|(i, _)| SegmentToken::new(i as u64))
            .collect()
    }

    /// Total number of segments created in this transaction (ended or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    /// Whether no segments have been started.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    /// Computes the exclusive duration of `token`: its own duration minus the
    /// sum of its ended children's durations (§3 Segment).
    #[must_use]
    pub fn exclusive_duration(&self, token: SegmentToken) -> Duration {
        let Some(segment) = self.get(token) else {
            return Duration::ZERO;
        };
        let Some(total) = segment.duration() else {
            return Duration::ZERO;
        };
        let children_total: Duration = segment
            .children
            .iter()
            .filter_map(|&child| self.get(child).and_then(Segment::duration))
            .sum();
        total.saturating_sub(children_total)
    }
}
