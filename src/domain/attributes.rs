//! Dynamic attribute values and the destination filter (§4.4, §9).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain_types::AttributeKey;

/// A dynamic attribute value attached to a transaction, error, or trace.
///
/// Modeled as a tagged variant per §9: only numeric, boolean, or string values
/// are accepted by `AddAttribute`; anything else is rejected with
/// [`crate::error::TransactionError::InvalidType`] before it ever reaches this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A double-precision number.
    Number(f64),
    /// A boolean flag.
    Bool(bool),
    /// A UTF-8 string, capped at 255 bytes (enforced at the call site).
    String(String),
}

impl AttributeValue {
    /// Byte length this value would occupy when validating the 255-byte string cap.
    /// Non-string values are always within bounds.
    #[must_use]
    pub fn exceeds_byte_cap(&self, cap: usize) -> bool {
        matches!(self, Self::String(s) if s.len() > cap)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// Maximum number of user attributes a single transaction may carry (§4.2).
pub const MAX_USER_ATTRIBUTES_PER_TRANSACTION: usize = 64;

/// Maximum byte length of an attribute string value (§4.2).
pub const MAX_ATTRIBUTE_STRING_BYTES: usize = 255;

/// Separated agent- and user-supplied attribute buckets for one transaction (§3).
///
/// Agent attributes are populated by the instrumentation itself (request method,
/// status code, …) and are not subject to the 64-key user cap; user attributes
/// come from `AddAttribute` calls and are capped.
#[derive(Debug, Clone, Default)]
pub struct AttributeStore {
    agent: BTreeMap<AttributeKey, AttributeValue>,
    user: BTreeMap<AttributeKey, AttributeValue>,
}

impl AttributeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites an agent attribute.
    pub fn set_agent(&mut self, key: AttributeKey, value: AttributeValue) {
        self.agent.insert(key, value);
    }

    /// Inserts a user attribute, rejecting it if the per-transaction cap is reached
    /// and the key is not already present (overwriting an existing key never grows
    /// the count).
    ///
    /// # Errors
    ///
    /// Returns `Err(())` when the cap of [`MAX_USER_ATTRIBUTES_PER_TRANSACTION`]
    /// would be exceeded by adding a genuinely new key.
    pub fn set_user(&mut self, key: AttributeKey, value: AttributeValue) -> Result<(), ()> {
        if !self.user.contains_key(&key) && self.user.len() >= MAX_USER_ATTRIBUTES_PER_TRANSACTION
        {
            return Err(());
        }
        self.user.insert(key, value);
        Ok(())
    }

    /// Iterates over agent attributes.
    pub fn agent_iter(&self) -> impl Iterator<Item = (&AttributeKey, &AttributeValue)> {
        self.agent.iter()
    }

    /// Iterates over user attributes.
    pub fn user_iter(&self) -> impl Iterator<Item = (&AttributeKey, &AttributeValue)> {
        self.user.iter()
    }

    /// Number of user attributes currently stored.
    #[must_use]
    pub fn user_len(&self) -> usize {
        self.user.len()
    }
}

/// One of the four places a collected attribute may be sent (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Transaction (analytic) events.
    TxnEvents,
    /// Error traces and error events.
    ErrorCollector,
    /// Transaction traces.
    TxnTracer,
    /// Browser-monitoring injected payload.
    BrowserMonitoring,
}

impl Destination {
    /// All four destinations, in a stable order.
    #[must_use]
    pub fn all() -> [Self; 4] {
        [
            Self::TxnEvents,
            Self::ErrorCollector,
            Self::TxnTracer,
            Self::BrowserMonitoring,
        ]
    }

    fn bit(self) -> u8 {
        match self {
            Self::TxnEvents => 0b0001,
            Self::ErrorCollector => 0b0010,
            Self::TxnTracer => 0b0100,
            Self::BrowserMonitoring => 0b1000,
        }
    }
}

/// One include/exclude rule, e.g. `request.headers.*` excluded, `request.headers.accept`
/// included (a more specific include overrides a shorter exclude glob, §4.4).
#[derive(Debug, Clone)]
struct GlobRule {
    pattern: String,
    include: bool,
}

impl GlobRule {
    fn matches(&self, key: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == self.pattern,
        }
    }

    fn specificity(&self) -> usize {
        self.pattern.trim_end_matches('*').len()
    }
}

/// Precomputed include/exclude rules for every destination, plus the top-level
/// `attributes.enabled`/`include`/`exclude` rules applied before any destination
/// rule (§4.4).
#[derive(Debug, Clone, Default)]
pub struct DestinationFilter {
    top_level_enabled: bool,
    top_level_rules: Vec<GlobRule>,
    destination_enabled: [bool; 4],
    destination_rules: [Vec<GlobRule>; 4],
}

impl DestinationFilter {
    /// Builds a filter where every destination is enabled and has no rules
    /// (i.e. every attribute flows everywhere) — the default, permissive config.
    #[must_use]
    pub fn permit_all() -> Self {
        Self {
            top_level_enabled: true,
            top_level_rules: Vec::new(),
            destination_enabled: [true; 4],
            destination_rules: [Vec::new(), Vec::new(), Vec::new(), Vec::new()],
        }
    }

    /// Disables the top-level `attributes` section entirely; no attribute flows
    /// to any destination regardless of destination-level rules.
    pub fn disable_top_level(&mut self) {
        self.top_level_enabled = false;
    }

    /// Enables or disables a single destination.
    pub fn set_destination_enabled(&mut self, destination: Destination, enabled: bool) {
        self.destination_enabled[destination_index(destination)] = enabled;
    }

    /// Adds a top-level include/exclude glob, applied before destination rules.
    pub fn add_top_level_rule(&mut self, pattern: impl Into<String>, include: bool) {
        self.top_level_rules.push(GlobRule {
            pattern: pattern.into(),
            include,
        });
    }

    /// Adds an include/exclude glob scoped to one destination.
    pub fn add_destination_rule(
        &mut self,
        destination: Destination,
        pattern: impl Into<String>,
        include: bool,
    ) {
        self.destination_rules[destination_index(destination)].push(GlobRule {
            pattern: pattern.into(),
            include,
        });
    }

    /// Whether `key` is allowed to flow to `destination`, after applying the
    /// top-level rules and then the destination-specific rules. Exclude wins a
    /// tie; a more specific include (longer non-wildcard prefix) overrides a
    /// less specific exclude.
    #[must_use]
    pub fn allows(&self, key: &str, destination: Destination) -> bool {
        if !self.top_level_enabled {
            return false;
        }
        if !self.destination_enabled[destination_index(destination)] {
            return false;
        }
        if !Self::resolve(&self.top_level_rules, key, true) {
            return false;
        }
        Self::resolve(&self.destination_rules[destination_index(destination)], key, true)
    }

    fn resolve(rules: &[GlobRule], key: &str, default: bool) -> bool {
        let mut best: Option<&GlobRule> = None;
        for rule in rules {
            if !rule.matches(key) {
                continue;
            }
            match best {
                None => best = Some(rule),
                Some(current) => {
                    if rule.specificity() > current.specificity()
                        || (rule.specificity() == current.specificity() && !rule.include)
                    {
                        best = Some(rule);
                    }
                }
            }
        }
        best.map_or(default, |rule| rule.include)
    }

    /// Computes the destination bitmask for a key, matching all four
    /// destinations in one pass (§4.4 "compile-time model").
    #[must_use]
    pub fn destination_mask(&self, key: &str) -> u8 {
        Destination::all()
            .into_iter()
            .filter(|&d| self.allows(key, d))
            .fold(0u8, |mask, d| mask | d.bit())
    }
}

fn destination_index(destination: Destination) -> usize {
    match destination {
        Destination::TxnEvents => 0,
        Destination::ErrorCollector => 1,
        Destination::TxnTracer => 2,
        Destination::BrowserMonitoring => 3,
    }
}
