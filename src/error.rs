//! Error types for the APM agent core (§7 Error Handling Design).
//!
//! Three independent taxonomies, matching the three places the spec requires
//! typed, non-panicking error handling: transaction mutators, the collector
//! wire protocol, and configuration loading.

use thiserror::Error;

/// Outcome of a `Transaction` mutator call. Transaction-side errors are
/// returned, never thrown (§7) — host code always gets a `Result`, and a
/// failing call never aborts the transaction itself.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionError {
    /// The transaction has already called `End`; every mutator after that
    /// point returns this (§3 Transaction invariants).
    #[error("transaction has already ended")]
    AlreadyEnded,

    /// `AddAttribute` was called with a value that is not numeric, boolean,
    /// or a string ≤255 bytes (§4.2).
    #[error("attribute value or key is not a valid type")]
    InvalidType,

    /// The caller attempted to add a 65th user attribute (§4.2).
    #[error("user attribute cap reached for this transaction")]
    AttributeCapReached,

    /// `NoticeError` was called with no underlying error available to report.
    #[error("no error was provided to NoticeError")]
    NilError,

    /// Error collection is disabled by local configuration.
    #[error("error collection is disabled by configuration")]
    ErrorsDisabled,

    /// The attribute or error is blocked because the agent is running in
    /// high-security mode (§4.2, §7).
    #[error("operation is blocked by high security mode")]
    HighSecurityBlocked,

    /// The attribute or error is blocked by a server-supplied security policy.
    #[error("operation is blocked by a security policy")]
    SecurityPolicyBlocked,
}

/// Classification of a reply (or the absence of one) from the collector,
/// driving the Harvest Processor's reconnect/drop/merge-back decision (§7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    /// The license key was rejected. Terminal: the agent stops reporting.
    #[error("license key rejected by collector")]
    InvalidLicense,

    /// The collector told the agent to disconnect permanently. Terminal.
    #[error("collector issued a forced disconnect")]
    ForceDisconnect,

    /// The collector told the agent to reconnect with a fresh payload.
    /// Recoverable: the processor spawns a new connector task.
    #[error("collector requested a forced restart")]
    ForceRestart,

    /// The payload was rejected as too large (HTTP 413). Drop it, no retry.
    #[error("payload exceeded the collector's size limit")]
    PayloadTooLarge,

    /// The payload's media type was rejected (HTTP 415). Drop it, no retry.
    #[error("payload had an unsupported media type")]
    UnsupportedMedia,

    /// A transient failure: network error, timeout, or 5xx/other 4xx. The
    /// payload should be merged back into the next harvest.
    #[error("transient collector failure: {0}")]
    Transient(String),
}

impl CollectorError {
    /// Classifies an HTTP status code per the taxonomy in §7/§4.1.
    #[must_use]
    pub fn classify_status(status: u16, body_message: Option<&str>) -> Option<Self> {
        match status {
            200..=299 => None,
            401 => Some(Self::InvalidLicense),
            410 => Some(Self::ForceDisconnect),
            409 => Some(Self::ForceRestart),
            413 => Some(Self::PayloadTooLarge),
            415 => Some(Self::UnsupportedMedia),
            _ => Some(Self::Transient(
                body_message
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("http status {status}")),
            )),
        }
    }

    /// Whether this error is terminal (no retry, no reconnect attempt).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidLicense | Self::ForceDisconnect)
    }

    /// Whether the processor should merge the undelivered payload back into
    /// the next harvest rather than discarding it.
    #[must_use]
    pub fn should_merge_back(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors from loading and validating [`crate::collector::config::Config`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required field (e.g. the license key) was missing from every source.
    #[error("missing required configuration value: {0}")]
    Missing(&'static str),

    /// A value was present but failed validation (e.g. an empty app name).
    #[error("invalid configuration for {field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable reason the value was rejected.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_success_as_none() {
        assert_eq!(CollectorError::classify_status(200, None), None);
        assert_eq!(CollectorError::classify_status(204, None), None);
    }

    #[test]
    fn classifies_terminal_statuses() {
        assert_eq!(
            CollectorError::classify_status(401, None),
            Some(CollectorError::InvalidLicense)
        );
        assert_eq!(
            CollectorError::classify_status(410, None),
            Some(CollectorError::ForceDisconnect)
        );
        assert!(CollectorError::classify_status(401, None).unwrap().is_terminal());
    }

    #[test]
    fn classifies_force_restart() {
        assert_eq!(
            CollectorError::classify_status(409, None),
            Some(CollectorError::ForceRestart)
        );
    }

    #[test]
    fn classifies_drop_without_retry_statuses() {
        let too_large = CollectorError::classify_status(413, None).unwrap();
        assert!(!too_large.should_merge_back());
        assert!(!too_large.is_terminal());
    }

    #[test]
    fn classifies_other_statuses_as_transient_and_mergeable() {
        let err = CollectorError::classify_status(503, None).unwrap();
        assert!(err.should_merge_back());
        assert!(!err.is_terminal());
    }
}
