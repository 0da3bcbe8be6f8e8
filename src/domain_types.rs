//! Domain types for the APM agent core
//!
//! This module defines strongly-typed domain values to prevent primitive obsession
//! and improve type safety throughout the codebase. Most wrap a primitive through
//! [`nutype`] so that construction is the only place validation can fail.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a connected agent session, assigned by the collector.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRef,
    TryFrom,
    Into
))]
pub struct RunId(String);

/// Name of the host application as reported at connect.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AppName(String);

/// License key used to authenticate with the collector. Never logged in full.
#[nutype(
    validate(len_char_min = 1),
    derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, AsRef, TryFrom, Into)
)]
pub struct LicenseKey(String);

impl std::fmt::Display for LicenseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.as_ref();
        let visible = inner.len().min(4);
        write!(f, "{}...redacted", &inner[..visible])
    }
}

/// Name of a transaction, metric, or trace, as seen by the collector.
///
/// Working names are mutable until [`crate::domain::transaction::Transaction::end`]
/// freezes them; this type only constrains length, not mutability.
#[nutype(
    validate(len_char_min = 1, len_char_max = 1000),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Ord,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct MetricName(String);

/// Scope under which a metric was recorded (empty string means unscoped).
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Ord,
    PartialOrd,
    Serialize,
    Deserialize,
    Display,
    Default,
    TryFrom,
    Into
))]
pub struct MetricScope(String);

impl MetricScope {
    /// The unscoped (empty) scope.
    #[must_use]
    pub fn unscoped() -> Self {
        Self::default()
    }

    /// True when this is the unscoped sentinel.
    #[must_use]
    pub fn is_unscoped(&self) -> bool {
        self.as_ref().is_empty()
    }
}

/// An attribute key. Capped at 255 bytes per §4.2.
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Ord,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct AttributeKey(String);

/// Reservoir-sampling priority, drawn uniformly from `[0, 1)` and perturbed
/// slightly by inbound distributed-trace context (§4.2 End()).
#[nutype(
    validate(greater_or_equal = 0.0, less_than = 1.000_001),
    derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default, TryFrom, Into)
)]
pub struct Priority(f64);

impl Priority {
    /// Nudges a priority by a small delta, clamping back into range.
    #[must_use]
    pub fn adjusted(self, delta: f64) -> Self {
        let raw = (self.into_inner() + delta).clamp(0.0, 1.0);
        Self::try_new(raw).unwrap_or_default()
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.into_inner().total_cmp(&other.into_inner())
    }
}

/// Apdex satisfying-response threshold, in seconds. Must be positive (§4.2).
#[nutype(
    validate(greater_than = 0.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, TryFrom, Into)
)]
pub struct ApdexThresholdSeconds(f64);

impl Default for ApdexThresholdSeconds {
    fn default() -> Self {
        Self::try_new(0.5).expect("0.5 is a valid apdex threshold")
    }
}

/// Per-harvest-kind cap on the number of events a reservoir retains (§3 Harvest).
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ReservoirCapacity(usize);

impl ReservoirCapacity {
    /// Returns the capacity as a `usize`.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Bounded capacity of the processor's `dataIn` channel (§4.1).
#[nutype(
    validate(greater_or_equal = 1),
    derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, TryFrom, Into)
)]
pub struct DataChannelCapacity(usize);

impl DataChannelCapacity {
    /// Returns the capacity as a `usize`.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

impl Default for DataChannelCapacity {
    fn default() -> Self {
        Self::try_new(200).expect("200 is a valid channel capacity")
    }
}

/// Unique identifier assigned to every `Transaction` for correlation in logs.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generates a new random transaction id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// W3C/New-Relic-style trace identifier carried on the distributed-trace payload.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct TraceId(String);

impl TraceId {
    /// Generates a new random trace id (32 lowercase hex characters).
    #[must_use]
    pub fn generate() -> Self {
        Self::try_new(Uuid::new_v4().simple().to_string())
            .expect("a freshly generated uuid always fits the trace id constraints")
    }
}

/// Identifier of a single span within a trace.
#[nutype(
    validate(len_char_min = 1, len_char_max = 32),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct SpanId(String);

impl SpanId {
    /// Generates a new random span id (16 lowercase hex characters).
    #[must_use]
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self::try_new(hex[..16].to_string())
            .expect("a truncated uuid hex string always fits the span id constraints")
    }
}

/// Opaque token returned by `StartSegment`, redeemed by `EndSegment`/`EndDatastore`/
/// `EndExternal`/`EndMessage`. An unknown token is defined to be a no-op (§4.2).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    TryFrom,
    Into
))]
pub struct SegmentToken(u64);
