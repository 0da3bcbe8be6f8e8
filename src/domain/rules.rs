//! Server-supplied rewrite rules: metric rules, URL rules, transaction-name rules
//! (§4.2 "Metric rules application").

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One regex-substitution rule as handed down by the collector at connect.
///
/// Rules are applied in the order the server declared them. A rule may mark the
/// resulting name `ignore` (drop the metric entirely) or `terminate_chain` (stop
/// applying further rules after this one matches).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRule {
    #[serde(with = "serde_regex")]
    pattern: SerializableRegex,
    replacement: String,
    ignore: bool,
    terminate_chain: bool,
    each_segment: bool,
    eval_order: i32,
}

/// Wraps [`Regex`] so it can derive nothing special; kept as a thin newtype to
/// give `serde_regex`-like (de)serialization a stable anchor without pulling in
/// an extra crate purely for this one field.
#[derive(Debug, Clone)]
struct SerializableRegex(Regex);

mod serde_regex {
    use super::SerializableRegex;
    use regex::Regex;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(re: &SerializableRegex, s: S) -> Result<S::Ok, S::Error> {
        re.0.as_str().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<SerializableRegex, D::Error> {
        let raw = String::deserialize(d)?;
        Regex::new(&raw)
            .map(SerializableRegex)
            .map_err(serde::de::Error::custom)
    }
}

impl RewriteRule {
    /// Builds a rule from its collector-wire fields.
    ///
    /// # Errors
    ///
    /// Returns the regex compile error if `pattern` is not a valid regex.
    pub fn new(
        pattern: &str,
        replacement: impl Into<String>,
        ignore: bool,
        terminate_chain: bool,
        each_segment: bool,
        eval_order: i32,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: SerializableRegex(Regex::new(pattern)?),
            replacement: replacement.into(),
            ignore,
            terminate_chain,
            each_segment,
            eval_order,
        })
    }
}

/// An ordered set of rewrite rules, sorted by `eval_order` at construction so
/// applying them is always in server-declared order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RewriteRule>,
}

/// The outcome of running a name through a [`RuleSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// The (possibly rewritten) name survived all applicable rules.
    Kept(String),
    /// A rule marked this name (or one of its segments) as ignored; the metric
    /// should be dropped entirely.
    Ignored,
}

impl RuleSet {
    /// Builds a rule set, sorting by `eval_order`.
    #[must_use]
    pub fn new(mut rules: Vec<RewriteRule>) -> Self {
        rules.sort_by_key(|r| r.eval_order);
        Self { rules }
    }

    /// Applies every matching rule in order to `input`. Termination is
    /// guaranteed in at most `len(rules)` steps (§8 rule-application
    /// termination) because each rule is visited at most once per call.
    #[must_use]
    pub fn apply(&self, input: &str) -> RuleOutcome {
        let mut current = input.to_string();
        for rule in &self.rules {
            if rule.each_segment {
                let rewritten: Vec<String> = current
                    .split('/')
                    .map(|segment| rule.pattern.0.replace_all(segment, rule.replacement.as_str()).into_owned())
                    .collect();
                current = rewritten.join("/");
            } else if rule.pattern.0.is_match(&current) {
                current = rule
                    .pattern
                    .0
                    .replace_all(&current, rule.replacement.as_str())
                    .into_owned();
            } else {
                continue;
            }

            if rule.ignore {
                return RuleOutcome::Ignored;
            }
            if rule.terminate_chain {
                break;
            }
        }
        RuleOutcome::Kept(current)
    }

    /// Number of rules in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ruleset_is_identity() {
        let rules = RuleSet::default();
        assert_eq!(rules.apply("WebTransaction/Go/foo"), RuleOutcome::Kept("WebTransaction/Go/foo".into()));
    }

    #[test]
    fn rule_rewrites_matching_segment() {
        let rule = RewriteRule::new(r"^/users/\d+$", "/users/*", false, false, false, 0).unwrap();
        let set = RuleSet::new(vec![rule]);
        assert_eq!(
            set.apply("/users/42"),
            RuleOutcome::Kept("/users/*".into())
        );
    }

    #[test]
    fn ignore_rule_drops_the_metric() {
        let rule = RewriteRule::new(r"^/health$", "", true, false, false, 0).unwrap();
        let set = RuleSet::new(vec![rule]);
        assert_eq!(set.apply("/health"), RuleOutcome::Ignored);
    }

    #[test]
    fn terminate_chain_stops_further_rules() {
        let first = RewriteRule::new(r"^/a$", "/b", false, true, false, 0).unwrap();
        let second = RewriteRule::new(r"^/b$", "/c", false, false, false, 1).unwrap();
        let set = RuleSet::new(vec![first, second]);
        assert_eq!(set.apply("/a"), RuleOutcome::Kept("/b".into()));
    }

    #[test]
    fn rules_apply_in_eval_order_not_insertion_order() {
        let first_declared = RewriteRule::new(r"^/b$", "/c", false, false, false, 1).unwrap();
        let second_declared = RewriteRule::new(r"^/a$", "/b", false, false, false, 0).unwrap();
        let set = RuleSet::new(vec![first_declared, second_declared]);
        assert_eq!(set.apply("/a"), RuleOutcome::Kept("/c".into()));
    }

    proptest::proptest! {
        #[test]
        fn application_terminates_within_rule_count(input in "[a-zA-Z0-9/]{0,32}") {
            let rules = vec![
                RewriteRule::new(r"[0-9]+", "*", false, false, false, 0).unwrap(),
                RewriteRule::new(r"//+", "/", false, false, false, 1).unwrap(),
            ];
            let set = RuleSet::new(rules);
            // apply() is a straight-line loop over at most `len` rules; reaching
            // this point at all demonstrates termination within that bound.
            let _ = set.apply(&input);
            prop_assert!(set.len() <= 2);
        }
    }
}
