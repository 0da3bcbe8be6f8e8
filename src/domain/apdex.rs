//! Apdex satisfaction-zone classification (§4.2, GLOSSARY).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain_types::ApdexThresholdSeconds;

/// Apdex zone a transaction's response time falls into relative to a threshold `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApdexZone {
    /// Duration ≤ T.
    Satisfying,
    /// T < duration ≤ 4T.
    Tolerating,
    /// duration > 4T, or the transaction recorded an error.
    Failing,
    /// Apdex does not apply (non-web transactions).
    None,
}

impl ApdexZone {
    /// Single-character code used on the wire (`nr.apdexPerfZone`).
    #[must_use]
    pub fn wire_code(self) -> &'static str {
        match self {
            Self::Satisfying => "S",
            Self::Tolerating => "T",
            Self::Failing => "F",
            Self::None => "",
        }
    }

    /// Classifies a duration against a threshold. Always returns exactly one of
    /// `Satisfying`/`Tolerating`/`Failing` (never `None`) — the *apdex zone
    /// completeness* property from §8.
    #[must_use]
    pub fn classify(duration: Duration, threshold: ApdexThresholdSeconds) -> Self {
        let threshold = Duration::from_secs_f64(threshold.into_inner());
        if duration <= threshold {
            Self::Satisfying
        } else if duration <= threshold * 4 {
            Self::Tolerating
        } else {
            Self::Failing
        }
    }

    /// A transaction that recorded an error is always `Failing`, regardless of
    /// duration (§4.2 End()).
    #[must_use]
    pub fn classify_web(
        duration: Duration,
        threshold: ApdexThresholdSeconds,
        had_error: bool,
    ) -> Self {
        if had_error {
            Self::Failing
        } else {
            Self::classify(duration, threshold)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(secs: f64) -> ApdexThresholdSeconds {
        ApdexThresholdSeconds::try_new(secs).unwrap()
    }

    #[test]
    fn classifies_satisfying_at_exactly_threshold() {
        let zone = ApdexZone::classify(Duration::from_millis(500), threshold(0.5));
        assert_eq!(zone, ApdexZone::Satisfying);
    }

    #[test]
    fn classifies_tolerating_just_above_threshold() {
        let zone = ApdexZone::classify(Duration::from_millis(501), threshold(0.5));
        assert_eq!(zone, ApdexZone::Tolerating);
    }

    #[test]
    fn classifies_tolerating_at_4x_threshold() {
        let zone = ApdexZone::classify(Duration::from_millis(2000), threshold(0.5));
        assert_eq!(zone, ApdexZone::Tolerating);
    }

    #[test]
    fn classifies_failing_beyond_4x_threshold() {
        let zone = ApdexZone::classify(Duration::from_millis(2001), threshold(0.5));
        assert_eq!(zone, ApdexZone::Failing);
    }

    #[test]
    fn error_forces_failing_regardless_of_duration() {
        let zone = ApdexZone::classify_web(Duration::from_millis(1), threshold(0.5), true);
        assert_eq!(zone, ApdexZone::Failing);
    }

    proptest::proptest! {
        #[test]
        fn zone_is_never_none_for_web(millis in 0u64..100_000, threshold_millis in 1u64..10_000) {
            let zone = ApdexZone::classify(
                Duration::from_millis(millis),
                ApdexThresholdSeconds::try_new(threshold_millis as f64 / 1000.0).unwrap(),
            );
            prop_assert!(matches!(zone, ApdexZone::Satisfying | ApdexZone::Tolerating | ApdexZone::Failing));
        }
    }
}
