//! The metrics table: `(name, scope)` keyed six-tuple aggregates (§4.3).

use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::apdex::ApdexZone;
use crate::domain_types::{MetricName, MetricScope};

/// One metric's six-tuple aggregate: count, total, exclusive, min, max, sum of squares.
///
/// For an ordinary timed metric these fields hold durations in seconds. Apdex
/// metrics repurpose the same fields to carry satisfying/tolerating/failing
/// counts instead (`count`=satisfying, `total`=tolerating, `exclusive`=failing),
/// matching the wire convention in §6/§8.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricValue {
    pub count: u64,
    pub total: f64,
    pub exclusive: f64,
    pub min: f64,
    pub max: f64,
    pub sum_of_squares: f64,
}

impl MetricValue {
    fn timed(elapsed: Duration, exclusive: Duration) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        Self {
            count: 1,
            total: elapsed_secs,
            exclusive: exclusive.as_secs_f64(),
            min: elapsed_secs,
            max: elapsed_secs,
            sum_of_squares: elapsed_secs * elapsed_secs,
        }
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.total += other.total;
        self.exclusive += other.exclusive;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum_of_squares += other.sum_of_squares;
    }

    fn add_apdex(&mut self, zone: ApdexZone) {
        match zone {
            ApdexZone::Satisfying => self.count += 1,
            ApdexZone::Tolerating => self.total += 1.0,
            ApdexZone::Failing => self.exclusive += 1.0,
            ApdexZone::None => {}
        }
    }
}

/// `(name, scope)` keyed table of metric aggregates, merged componentwise on
/// harvest failure (§4.3, §8 "merge idempotence on metrics").
#[derive(Debug, Clone, Default)]
pub struct MetricsTable {
    values: BTreeMap<(MetricName, MetricScope), MetricValue>,
}

impl MetricsTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one occurrence of a timed metric.
    pub fn record(&mut self, name: MetricName, scope: MetricScope, elapsed: Duration, exclusive: Duration) {
        let sample = MetricValue::timed(elapsed, exclusive);
        self.values
            .entry((name, scope))
            .and_modify(|v| v.merge(&sample))
            .or_insert(sample);
    }

    /// Records one apdex observation, repurposing the six-tuple's first three
    /// fields as satisfying/tolerating/failing counts.
    pub fn record_apdex(&mut self, name: MetricName, zone: ApdexZone) {
        let entry = self.values.entry((name, MetricScope::unscoped())).or_insert(MetricValue {
            count: 0,
            total: 0.0,
            exclusive: 0.0,
            min: 0.0,
            max: 0.0,
            sum_of_squares: 0.0,
        });
        entry.add_apdex(zone);
    }

    /// Merges `other` into `self` componentwise: counts/totals add, min/max
    /// take the elementwise min/max.
    pub fn merge(&mut self, other: Self) {
        for (key, value) in other.values {
            self.values
                .entry(key)
                .and_modify(|existing| existing.merge(&value))
                .or_insert(value);
        }
    }

    /// Looks up a metric by name and scope.
    #[must_use]
    pub fn get(&self, name: &MetricName, scope: &MetricScope) -> Option<&MetricValue> {
        self.values.get(&(name.clone(), scope.clone()))
    }

    /// Iterates every `((name, scope), value)` pair.
    pub fn iter(&self) -> impl Iterator<Item = (&(MetricName, MetricScope), &MetricValue)> {
        self.values.iter()
    }

    /// Number of distinct `(name, scope)` keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the table has no recorded metrics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> MetricName {
        MetricName::try_new(s).unwrap()
    }

    #[test]
    fn merging_empty_table_is_identity() {
        let mut table = MetricsTable::new();
        table.record(name("Custom/x"), MetricScope::unscoped(), Duration::from_millis(10), Duration::from_millis(10));
        let before = table.clone();
        table.merge(MetricsTable::new());
        assert_eq!(table.len(), before.len());
        let key = (name("Custom/x"), MetricScope::unscoped());
        assert_eq!(table.get(&key.0, &key.1), before.get(&key.0, &key.1));
    }

    #[test]
    fn merge_adds_counts_and_tracks_min_max() {
        let mut a = MetricsTable::new();
        a.record(name("Custom/x"), MetricScope::unscoped(), Duration::from_millis(10), Duration::from_millis(10));
        let mut b = MetricsTable::new();
        b.record(name("Custom/x"), MetricScope::unscoped(), Duration::from_millis(50), Duration::from_millis(50));

        a.merge(b);
        let value = a.get(&name("Custom/x"), &MetricScope::unscoped()).unwrap();
        assert_eq!(value.count, 2);
        assert!((value.min - 0.010).abs() < 1e-9);
        assert!((value.max - 0.050).abs() < 1e-9);
    }

    #[test]
    fn apdex_metric_repurposes_fields_as_zone_counts() {
        let mut table = MetricsTable::new();
        let apdex_name = name("Apdex/Go/x");
        table.record_apdex(apdex_name.clone(), ApdexZone::Satisfying);
        table.record_apdex(apdex_name.clone(), ApdexZone::Satisfying);
        table.record_apdex(apdex_name.clone(), ApdexZone::Tolerating);
        table.record_apdex(apdex_name.clone(), ApdexZone::Failing);

        let value = table.get(&apdex_name, &MetricScope::unscoped()).unwrap();
        assert_eq!(value.count, 2);
        assert!((value.total - 1.0).abs() < f64::EPSILON);
        assert!((value.exclusive - 1.0).abs() < f64::EPSILON);
    }
}
