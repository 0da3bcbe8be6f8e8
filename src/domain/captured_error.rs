//! Errors captured on a transaction via `NoticeError` or a synthetic HTTP-status
//! error (§3 Transaction, §4.2, §7).

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::domain::attributes::AttributeValue;
use crate::domain_types::AttributeKey;

/// Placeholder message substituted for the real error message in high-security
/// mode; the stack trace is still captured (§4.2 NoticeError).
pub const HIGH_SECURITY_PLACEHOLDER: &str = "Message removed by high security mode";

/// Number of stack frames a captured error's trace is truncated to (§4.3).
pub const MAX_STACK_FRAMES: usize = 100;

/// One error captured during a transaction's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedError {
    /// Wall-clock time the error was captured.
    pub when: SystemTime,
    /// Error "class", e.g. `errors.errorString` for a generic Rust error, or
    /// the HTTP status class for a synthetic response-code error.
    pub class: String,
    /// Human-readable message (redacted in high-security mode).
    pub message: String,
    /// Truncated stack trace, one frame per entry, innermost first.
    pub stack: Vec<String>,
    /// Attribute snapshot taken at capture time.
    pub attributes: Vec<(AttributeKey, AttributeValue)>,
}

impl CapturedError {
    /// Builds a captured error, truncating the stack to [`MAX_STACK_FRAMES`] and
    /// substituting the high-security placeholder message if requested.
    #[must_use]
    pub fn new(
        when: SystemTime,
        class: impl Into<String>,
        message: impl Into<String>,
        mut stack: Vec<String>,
        attributes: Vec<(AttributeKey, AttributeValue)>,
        high_security: bool,
    ) -> Self {
        stack.truncate(MAX_STACK_FRAMES);
        let message = if high_security {
            HIGH_SECURITY_PLACEHOLDER.to_string()
        } else {
            message.into()
        };
        Self {
            when,
            class: class.into(),
            message,
            stack,
            attributes,
        }
    }

    /// Builds the captured error representing a Rust panic unwound through
    /// `End` (§4.2 End(), §9 "Panic capture").
    #[must_use]
    pub fn from_panic(when: SystemTime, payload: &str, high_security: bool) -> Self {
        Self::new(when, "panic", payload, Vec::new(), Vec::new(), high_security)
    }
}

/// A ring buffer of captured errors, capped at `capacity` with oldest-drop on
/// overflow (§3 Transaction "errors list never exceeds its cap").
#[derive(Debug, Clone)]
pub struct ErrorRing {
    capacity: usize,
    errors: std::collections::VecDeque<CapturedError>,
}

impl ErrorRing {
    /// Creates a ring with the given capacity (default 5 per §3).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            errors: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    /// Pushes an error, dropping the oldest if the ring is already full.
    pub fn push(&mut self, error: CapturedError) {
        if self.errors.len() >= self.capacity {
            self.errors.pop_front();
        }
        self.errors.push_back(error);
    }

    /// Number of errors currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterates the retained errors, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &CapturedError> {
        self.errors.iter()
    }

    /// Drains the ring, returning its contents in oldest-first order.
    pub fn drain(&mut self) -> Vec<CapturedError> {
        self.errors.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(message: &str) -> CapturedError {
        CapturedError::new(SystemTime::now(), "test.Error", message, Vec::new(), Vec::new(), false)
    }

    #[test]
    fn ring_never_exceeds_capacity() {
        let mut ring = ErrorRing::new(5);
        for i in 0..20 {
            ring.push(error(&format!("error {i}")));
        }
        assert_eq!(ring.len(), 5);
    }

    #[test]
    fn ring_drops_oldest_first() {
        let mut ring = ErrorRing::new(2);
        ring.push(error("first"));
        ring.push(error("second"));
        ring.push(error("third"));
        let remaining: Vec<_> = ring.iter().map(|e| e.message.clone()).collect();
        assert_eq!(remaining, vec!["second".to_string(), "third".to_string()]);
    }

    #[test]
    fn high_security_redacts_message_but_keeps_stack() {
        let err = CapturedError::new(
            SystemTime::now(),
            "test.Error",
            "sensitive details",
            vec!["frame1".to_string()],
            Vec::new(),
            true,
        );
        assert_eq!(err.message, HIGH_SECURITY_PLACEHOLDER);
        assert_eq!(err.stack, vec!["frame1".to_string()]);
    }

    #[test]
    fn stack_is_truncated_to_max_frames() {
        let stack: Vec<String> = (0..200).map(|i| format!("frame{i}")).collect();
        let err = CapturedError::new(SystemTime::now(), "test.Error", "msg", stack, Vec::new(), false);
        assert_eq!(err.stack.len(), MAX_STACK_FRAMES);
    }
}
