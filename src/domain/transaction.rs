//! The Transaction state machine (§4.2).
//!
//! A `Transaction` has two visible states, `open` and `ended`. Every public
//! method is guarded by a single `Mutex` because segment-end calls may arrive
//! from worker tasks while the response writer runs on the request-serving
//! thread (§5). [`Transaction::new_handle`] hands out a second reference that
//! shares the same lock, matching §9's "coroutine/thread sharing" note.

use rand::Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::domain::agent_run::AgentRun;
use crate::domain::apdex::ApdexZone;
use crate::domain::attributes::{
    AttributeStore, AttributeValue, MAX_ATTRIBUTE_STRING_BYTES,
};
use crate::domain::captured_error::{CapturedError, ErrorRing};
use crate::domain::dt_payload::DistributedTracePayload;
use crate::domain::rules::RuleOutcome;
use crate::domain::segment::{DatastoreInfo, ExternalInfo, MessageInfo, SegmentKind, SegmentTracer};
use crate::domain_types::{AttributeKey, Priority, SegmentToken, SpanId, TraceId, TransactionId};
use crate::error::TransactionError;
use crate::harvest::slow_query_set::{self, SlowQueryCandidate};
use crate::harvest::trace_bucket::TransactionTrace;

/// Default cap on the number of captured errors per transaction (§3).
pub const DEFAULT_ERROR_CAP: usize = 5;

/// The minimal information about an inbound web request needed to derive
/// transaction naming and agent attributes (§4.2 Start()).
#[derive(Debug, Clone, Default)]
pub struct WebRequestInfo {
    pub method: String,
    pub uri: String,
    pub host: String,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub distributed_trace_header: Option<String>,
}

fn strip_query(uri: &str) -> &str {
    uri.split('?').next().unwrap_or(uri)
}

struct TransactionInner {
    id: TransactionId,
    working_name: String,
    final_name: Option<String>,
    is_web: bool,
    start: Instant,
    start_wall: SystemTime,
    stop: Option<Instant>,
    apdex_zone: ApdexZone,
    ignored: bool,
    finished: bool,
    errors: ErrorRing,
    attributes: AttributeStore,
    tracer: SegmentTracer,
    response_code: Option<u16>,
    priority: Priority,
    trace_id: TraceId,
    span_id: SpanId,
    inbound_payload: Option<DistributedTracePayload>,
    high_security: bool,
    errors_enabled: bool,
    ignore_status_codes: Vec<u16>,
    slow_queries: Vec<SlowQueryCandidate>,
}

/// A fully-ended transaction, ready to be merged into a [`crate::harvest::harvest::Harvest`].
#[derive(Debug, Clone)]
pub struct EndedTransaction {
    pub id: TransactionId,
    pub name: String,
    pub is_web: bool,
    pub start: SystemTime,
    pub duration: Duration,
    pub exclusive_duration: Duration,
    pub apdex_zone: ApdexZone,
    pub response_code: Option<u16>,
    pub priority: Priority,
    pub trace_id: TraceId,
    pub errors: Vec<CapturedError>,
    pub agent_attributes: Vec<(AttributeKey, AttributeValue)>,
    pub user_attributes: Vec<(AttributeKey, AttributeValue)>,
    /// Segment tree captured depth-first, ready to be offered to a harvest's
    /// trace bucket (§4.3 "Trace bucket").
    pub trace: TransactionTrace,
    /// Datastore segments observed at or above the explicit-duration
    /// threshold, ready to be folded into a harvest's slow-query set.
    pub slow_queries: Vec<SlowQueryCandidate>,
}

/// A single unit of work: a web request or background task (§3 Transaction).
///
/// Cloning a `Transaction` (or calling [`Transaction::new_handle`]) yields a
/// second handle to the *same* underlying state; ending either handle ends
/// the transaction exactly once.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Mutex<TransactionInner>>,
}

impl Transaction {
    /// Starts a new transaction.
    ///
    /// `web_request` is `None` for background transactions; when present it
    /// drives request-derived agent attributes and inbound distributed-trace
    /// decoding (§4.2 Start()).
    #[must_use]
    pub fn start(
        name: impl Into<String>,
        web_request: Option<WebRequestInfo>,
        high_security: bool,
        errors_enabled: bool,
        ignore_status_codes: Vec<u16>,
    ) -> Self {
        let mut attributes = AttributeStore::new();
        let is_web = web_request.is_some();
        let mut inbound_payload = None;

        if let Some(req) = &web_request {
            let set = |attrs: &mut AttributeStore, key: &str, value: AttributeValue| {
                if let Ok(k) = AttributeKey::try_new(key) {
                    attrs.set_agent(k, value);
                }
            };
            set(&mut attributes, "request.method", req.method.clone().into());
            set(
                &mut attributes,
                "request.uri",
                strip_query(&req.uri).to_string().into(),
            );
            set(&mut attributes, "request.headers.host", req.host.clone().into());
            if let Some(len) = req.content_length {
                set(&mut attributes, "request.headers.contentLength", (len as f64).into());
            }
            if let Some(ct) = &req.content_type {
                set(&mut attributes, "request.headers.contentType", ct.clone().into());
            }
            if let Some(ua) = &req.user_agent {
                set(&mut attributes, "request.headers.userAgent", ua.clone().into());
            }
            if let Some(referer) = &req.referer {
                set(
                    &mut attributes,
                    "request.headers.referer",
                    strip_query(referer).to_string().into(),
                );
            }
            if let Some(header) = &req.distributed_trace_header {
                inbound_payload = DistributedTracePayload::decode(header).ok();
            }
        }

        let mut priority = random_priority();
        if inbound_payload.is_some() {
            priority = priority.adjusted(0.001);
        }

        let trace_id = inbound_payload
            .as_ref()
            .map(|p| TraceId::try_from(p.d.tr.clone()).unwrap_or_else(|_| TraceId::generate()))
            .unwrap_or_else(TraceId::generate);

        let inner = TransactionInner {
            id: TransactionId::generate(),
            working_name: name.into(),
            final_name: None,
            is_web,
            start: Instant::now(),
            start_wall: SystemTime::now(),
            stop: None,
            apdex_zone: ApdexZone::None,
            ignored: false,
            finished: false,
            errors: ErrorRing::new(DEFAULT_ERROR_CAP),
            attributes,
            tracer: SegmentTracer::new(),
            response_code: None,
            priority,
            trace_id,
            span_id: SpanId::generate(),
            inbound_payload,
            high_security,
            errors_enabled,
            ignore_status_codes,
            slow_queries: Vec::new(),
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Returns a second handle sharing this transaction's state (§9).
    #[must_use]
    pub fn new_handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// This transaction's stable identifier, usable before or after `End`.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.inner.lock().expect("transaction mutex poisoned").id
    }

    /// Replaces the working name. No-op-with-error once ended (§4.2 SetName).
    pub fn set_name(&self, name: impl Into<String>) -> Result<(), TransactionError> {
        let mut inner = self.inner.lock().expect("transaction mutex poisoned");
        if inner.finished {
            return Err(TransactionError::AlreadyEnded);
        }
        inner.working_name = name.into();
        Ok(())
    }

    /// Adds a user attribute (§4.2 AddAttribute).
    pub fn add_attribute(
        &self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Result<(), TransactionError> {
        let mut inner = self.inner.lock().expect("transaction mutex poisoned");
        if inner.finished {
            return Err(TransactionError::AlreadyEnded);
        }
        if inner.high_security {
            return Err(TransactionError::HighSecurityBlocked);
        }
        let value = value.into();
        if value.exceeds_byte_cap(MAX_ATTRIBUTE_STRING_BYTES) {
            return Err(TransactionError::InvalidType);
        }
        let key = AttributeKey::try_new(key.into()).map_err(|_| TransactionError::InvalidType)?;
        inner
            .attributes
            .set_user(key, value)
            .map_err(|()| TransactionError::AttributeCapReached)
    }

    /// Records an error on the transaction (§4.2 NoticeError).
    pub fn notice_error(
        &self,
        class: impl Into<String>,
        message: impl Into<String>,
        stack: Vec<String>,
    ) -> Result<(), TransactionError> {
        let mut inner = self.inner.lock().expect("transaction mutex poisoned");
        if inner.finished {
            return Err(TransactionError::AlreadyEnded);
        }
        if !inner.errors_enabled {
            return Err(TransactionError::ErrorsDisabled);
        }
        let high_security = inner.high_security;
        inner.errors.push(CapturedError::new(
            SystemTime::now(),
            class,
            message,
            stack,
            Vec::new(),
            high_security,
        ));
        Ok(())
    }

    /// Opens a new segment nested under `parent` (`None` for a root segment).
    ///
    /// Returns an opaque token even if the transaction has already ended;
    /// ending that token later is defined to be a no-op per §4.2, so callers
    /// never need to check a `Result` here.
    #[must_use]
    pub fn start_segment(&self, parent: Option<SegmentToken>) -> SegmentToken {
        let mut inner = self.inner.lock().expect("transaction mutex poisoned");
        inner.tracer.start_segment(Instant::now(), parent)
    }

    /// Ends a basic named segment. No-op if `token` is unknown, already ended,
    /// or the transaction itself has ended (§4.2).
    pub fn end_segment(&self, token: SegmentToken, name: impl Into<String>) {
        self.end_segment_kind(token, SegmentKind::Basic { name: name.into() });
    }

    /// Ends a datastore segment. When the segment carries query text and runs
    /// at or above the explicit-duration threshold, records a slow-query
    /// candidate to be folded into the harvest's slow-query set at `End` (§4.3).
    pub fn end_datastore(&self, token: SegmentToken, info: DatastoreInfo) {
        let query = info.query.clone();
        self.end_segment_kind(token, SegmentKind::Datastore(info));

        let Some(query) = query else {
            return;
        };
        let mut inner = self.inner.lock().expect("transaction mutex poisoned");
        let Some(duration) = inner.tracer.get(token).and_then(crate::domain::segment::Segment::duration) else {
            return;
        };
        if duration >= slow_query_set::EXPLICIT_DURATION_THRESHOLD {
            inner.slow_queries.push(SlowQueryCandidate {
                fingerprint: slow_query_set::fingerprint(&query),
                duration,
                sample_query: query,
                sample_params: None,
            });
        }
    }

    /// Ends an external-call segment.
    pub fn end_external(&self, token: SegmentToken, host: impl Into<String>, method: Option<String>) {
        self.end_segment_kind(
            token,
            SegmentKind::External(ExternalInfo {
                host: host.into(),
                method,
            }),
        );
    }

    /// Ends a message-queue segment.
    pub fn end_message(&self, token: SegmentToken, info: MessageInfo) {
        self.end_segment_kind(token, SegmentKind::Message(info));
    }

    fn end_segment_kind(&self, token: SegmentToken, kind: SegmentKind) {
        let mut inner = self.inner.lock().expect("transaction mutex poisoned");
        if inner.finished {
            return;
        }
        inner.tracer.end_segment(token, Instant::now(), kind);
    }

    /// Records the first observed response code, and synthesizes an error if
    /// it is ≥400 and not in the configured ignore list (§4.2 WriteHeader).
    pub fn write_header(&self, code: u16) {
        let mut inner = self.inner.lock().expect("transaction mutex poisoned");
        if inner.finished || inner.response_code.is_some() {
            return;
        }
        inner.response_code = Some(code);
        if code >= 400 && !inner.ignore_status_codes.contains(&code) && inner.errors_enabled {
            let high_security = inner.high_security;
            inner.errors.push(CapturedError::new(
                SystemTime::now(),
                format!("Http{code}"),
                format!("response status code: {code}"),
                Vec::new(),
                Vec::new(),
                high_security,
            ));
        }
    }

    /// Marks the transaction so `End` discards it without reporting any data.
    pub fn ignore(&self) {
        let mut inner = self.inner.lock().expect("transaction mutex poisoned");
        inner.ignored = true;
    }

    /// Captures a panic mid-flight as an error, without ending the
    /// transaction (§4.2 End(), §9 "Panic capture"). Host code recovering a
    /// panic should call this before calling `end`.
    pub fn notice_panic(&self, payload: &str) {
        let mut inner = self.inner.lock().expect("transaction mutex poisoned");
        if inner.finished {
            return;
        }
        let high_security = inner.high_security;
        inner
            .errors
            .push(CapturedError::from_panic(SystemTime::now(), payload, high_security));
    }

    /// Ends the transaction, computing its final name via `name_rules`,
    /// apdex zone, and handing back the immutable snapshot the processor
    /// will merge into a harvest. Idempotent: every call after the first
    /// returns `Err(AlreadyEnded)` and does not recompute anything (§4.2 End()).
    pub fn end(
        &self,
        name_rule_apply: impl FnOnce(&str) -> RuleOutcome,
        apdex_threshold: crate::domain_types::ApdexThresholdSeconds,
    ) -> Result<Option<EndedTransaction>, TransactionError> {
        let mut inner = self.inner.lock().expect("transaction mutex poisoned");
        if inner.finished {
            return Err(TransactionError::AlreadyEnded);
        }
        inner.finished = true;
        inner.stop = Some(Instant::now());

        if inner.ignored {
            return Ok(None);
        }

        let final_name = match name_rule_apply(&inner.working_name) {
            RuleOutcome::Kept(name) => name,
            RuleOutcome::Ignored => return Ok(None),
        };
        inner.final_name = Some(final_name.clone());

        let duration = inner.stop.unwrap().saturating_duration_since(inner.start);
        let exclusive = compute_exclusive(&inner, duration);
        let had_error = !inner.errors.is_empty();
        let apdex_zone = if inner.is_web {
            ApdexZone::classify_web(duration, apdex_threshold, had_error)
        } else {
            ApdexZone::None
        };

        let agent_attributes = inner.attributes.agent_iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let user_attributes = inner.attributes.user_iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let errors = inner.errors.drain();
        let trace = TransactionTrace::from_tracer(final_name.clone(), duration, &inner.tracer, inner.start);
        let slow_queries = std::mem::take(&mut inner.slow_queries);

        Ok(Some(EndedTransaction {
            id: inner.id,
            name: final_name,
            is_web: inner.is_web,
            start: inner.start_wall,
            duration,
            exclusive_duration: exclusive,
            apdex_zone,
            response_code: inner.response_code,
            priority: inner.priority,
            trace_id: inner.trace_id.clone(),
            errors,
            agent_attributes,
            user_attributes,
            trace,
            slow_queries,
        }))
    }

    /// Whether the transaction has already ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.lock().expect("transaction mutex poisoned").finished
    }
}

fn compute_exclusive(inner: &TransactionInner, total: Duration) -> Duration {
    let children_total: Duration = inner
        .tracer
        .roots()
        .into_iter()
        .filter_map(|token| inner.tracer.get(token).and_then(|s| s.duration()))
        .sum();
    total.saturating_sub(children_total)
}

fn random_priority() -> Priority {
    let raw: f64 = rand::rng().random_range(0.0..1.0);
    Priority::try_new(raw).unwrap_or_default()
}
