//! Slow-query aggregation, keyed by parameter-stripped query fingerprint (§4.3).

use std::collections::BTreeMap;
use std::time::Duration;

/// Datastore segments at or above this duration are recorded as slow-query
/// candidates (§4.3 "Slow-query set").
pub const EXPLICIT_DURATION_THRESHOLD: Duration = Duration::from_millis(500);

/// One slow-query observation captured at segment-end time, carried on an
/// [`crate::domain::transaction::EndedTransaction`] and folded into a
/// harvest's [`SlowQuerySet`] at transaction-end time.
#[derive(Debug, Clone)]
pub struct SlowQueryCandidate {
    pub fingerprint: String,
    pub duration: Duration,
    pub sample_query: String,
    pub sample_params: Option<Vec<String>>,
}

/// Aggregate statistics for every call matching one query fingerprint.
#[derive(Debug, Clone)]
pub struct SlowQueryStats {
    pub call_count: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
    /// One representative sample: the parameterized query text, captured on
    /// first sight of this fingerprint.
    pub sample_query: String,
    /// Bind parameters for the sample, present only when policy allows
    /// capturing them (§4.3 "if allowed by policy").
    pub sample_params: Option<Vec<String>>,
}

impl SlowQueryStats {
    fn first(duration: Duration, sample_query: String, sample_params: Option<Vec<String>>) -> Self {
        Self {
            call_count: 1,
            total_duration: duration,
            min_duration: duration,
            max_duration: duration,
            sample_query,
            sample_params,
        }
    }

    fn merge(&mut self, other: &Self) {
        self.call_count += other.call_count;
        self.total_duration += other.total_duration;
        self.min_duration = self.min_duration.min(other.min_duration);
        self.max_duration = self.max_duration.max(other.max_duration);
    }
}

/// Fingerprint-keyed slow-query aggregate. A fingerprint is the query text
/// after stripping literal parameter values, canonicalizing whitespace.
#[derive(Debug, Clone, Default)]
pub struct SlowQuerySet {
    queries: BTreeMap<String, SlowQueryStats>,
}

impl SlowQuerySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one query execution under `fingerprint`.
    pub fn record(
        &mut self,
        fingerprint: impl Into<String>,
        duration: Duration,
        sample_query: impl Into<String>,
        sample_params: Option<Vec<String>>,
    ) {
        let fingerprint = fingerprint.into();
        self.queries
            .entry(fingerprint)
            .and_modify(|stats| {
                stats.merge(&SlowQueryStats::first(duration, String::new(), None));
            })
            .or_insert_with(|| SlowQueryStats::first(duration, sample_query.into(), sample_params));
    }

    /// Merges another set into this one, combining counts for shared
    /// fingerprints and keeping each side's unique entries.
    pub fn merge(&mut self, other: Self) {
        for (fingerprint, stats) in other.queries {
            self.queries
                .entry(fingerprint)
                .and_modify(|existing| existing.merge(&stats))
                .or_insert(stats);
        }
    }

    /// Looks up the aggregate for a fingerprint.
    #[must_use]
    pub fn get(&self, fingerprint: &str) -> Option<&SlowQueryStats> {
        self.queries.get(fingerprint)
    }

    /// Iterates every `(fingerprint, stats)` pair.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &SlowQueryStats)> {
        self.queries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Canonicalizes a SQL statement into a fingerprint by stripping numeric and
/// quoted-string literals and collapsing whitespace.
#[must_use]
pub fn fingerprint(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    let mut last_was_space = false;
    while let Some(c) = chars.next() {
        if c == '\'' {
            out.push('?');
            for next in chars.by_ref() {
                if next == '\'' {
                    break;
                }
            }
            last_was_space = false;
        } else if c.is_ascii_digit() {
            out.push('?');
            while matches!(chars.peek(), Some(d) if d.is_ascii_digit() || *d == '.') {
                chars.next();
            }
            last_was_space = false;
        } else if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_strips_numeric_literals() {
        assert_eq!(fingerprint("SELECT * FROM t WHERE id = 42"), "SELECT * FROM t WHERE id = ?");
    }

    #[test]
    fn fingerprint_strips_string_literals() {
        assert_eq!(
            fingerprint("SELECT * FROM t WHERE name = 'bob'"),
            "SELECT * FROM t WHERE name = ?"
        );
    }

    #[test]
    fn same_fingerprint_aggregates_call_count() {
        let mut set = SlowQuerySet::new();
        set.record("SELECT * FROM t WHERE id = ?", Duration::from_millis(10), "SELECT * FROM t WHERE id = 1", None);
        set.record("SELECT * FROM t WHERE id = ?", Duration::from_millis(30), "SELECT * FROM t WHERE id = 2", None);
        let stats = set.get("SELECT * FROM t WHERE id = ?").unwrap();
        assert_eq!(stats.call_count, 2);
        assert_eq!(stats.min_duration, Duration::from_millis(10));
        assert_eq!(stats.max_duration, Duration::from_millis(30));
    }
}
