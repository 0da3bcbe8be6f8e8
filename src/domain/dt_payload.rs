//! Distributed-trace payload codec (§6, §9 "Distributed-trace payload encode/decode").
//!
//! The wire shape is a Base64-encoded JSON object: `{v:[major,minor], d:{...}}`.
//! This module is a pure codec; [`super::transaction::Transaction::start`] decodes
//! an inbound payload and [`super::transaction::Transaction::end`] can encode an
//! outbound one, but neither owns the format.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::domain_types::{Priority, SpanId, TraceId};

/// Major/minor version pair carried as `v` in the payload.
pub const SUPPORTED_VERSION: (u8, u8) = (0, 1);

/// The `d` (data) object of a distributed-trace payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedTracePayloadData {
    /// Caller type, e.g. `"App"`.
    pub ty: String,
    /// Trusted account key.
    pub ac: String,
    /// Application id.
    pub ap: String,
    /// Originating transaction id, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<String>,
    /// Originating span id, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Trace id, shared across the whole distributed trace.
    pub tr: String,
    /// Priority, propagated so all participants sample consistently.
    pub pr: f64,
    /// Sampled flag.
    pub sa: bool,
    /// Timestamp (unix millis) the payload was created.
    pub ti: i64,
}

/// A full distributed-trace payload: `{v: [major, minor], d: {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedTracePayload {
    pub v: (u8, u8),
    pub d: DistributedTracePayloadData,
}

/// Errors decoding an inbound distributed-trace header.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DtPayloadError {
    /// The header value was not valid Base64.
    #[error("distributed trace payload is not valid base64")]
    InvalidBase64,
    /// The decoded bytes were not valid UTF-8 JSON matching the payload shape.
    #[error("distributed trace payload is not valid json")]
    InvalidJson,
    /// The payload's major version is not one this agent understands.
    #[error("distributed trace payload version {0}.{1} is unsupported")]
    UnsupportedVersion(u8, u8),
}

impl DistributedTracePayload {
    /// Builds an outbound payload representing the current transaction.
    #[must_use]
    pub fn outbound(
        account_key: &str,
        app_id: &str,
        trace_id: &TraceId,
        span_id: Option<&SpanId>,
        priority: Priority,
        sampled: bool,
        now_unix_millis: i64,
    ) -> Self {
        Self {
            v: SUPPORTED_VERSION,
            d: DistributedTracePayloadData {
                ty: "App".to_string(),
                ac: account_key.to_string(),
                ap: app_id.to_string(),
                tx: None,
                id: span_id.map(std::string::ToString::to_string),
                tr: trace_id.to_string(),
                pr: priority.into_inner(),
                sa: sampled,
                ti: now_unix_millis,
            },
        }
    }

    /// Encodes this payload as the Base64(JSON) wire format for an HTTP header.
    ///
    /// # Panics
    ///
    /// Never panics: the payload always serializes, since every field is a plain
    /// owned value with no custom `Serialize` impl that can fail.
    #[must_use]
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("payload always serializes");
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    /// Decodes and validates an inbound header value.
    ///
    /// # Errors
    ///
    /// Returns [`DtPayloadError`] if the value is not valid Base64/JSON, or
    /// carries an unsupported major version.
    pub fn decode(header_value: &str) -> Result<Self, DtPayloadError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(header_value.trim())
            .map_err(|_| DtPayloadError::InvalidBase64)?;
        let payload: Self =
            serde_json::from_slice(&bytes).map_err(|_| DtPayloadError::InvalidJson)?;
        if payload.v.0 != SUPPORTED_VERSION.0 {
            return Err(DtPayloadError::UnsupportedVersion(payload.v.0, payload.v.1));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DistributedTracePayload {
        DistributedTracePayload::outbound(
            "12345",
            "67890",
            &TraceId::generate(),
            Some(&SpanId::generate()),
            Priority::try_new(0.5).unwrap(),
            true,
            1_700_000_000_000,
        )
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let payload = sample();
        let encoded = payload.encode();
        let decoded = DistributedTracePayload::decode(&encoded).unwrap();
        assert_eq!(decoded.d.tr, payload.d.tr);
        assert_eq!(decoded.d.ac, "12345");
    }

    #[test]
    fn rejects_invalid_base64() {
        assert_eq!(
            DistributedTracePayload::decode("not base64!!!"),
            Err(DtPayloadError::InvalidBase64)
        );
    }

    #[test]
    fn rejects_invalid_json() {
        let garbage = base64::engine::general_purpose::STANDARD.encode("not json");
        assert_eq!(
            DistributedTracePayload::decode(&garbage),
            Err(DtPayloadError::InvalidJson)
        );
    }

    #[test]
    fn rejects_unsupported_major_version() {
        let mut payload = sample();
        payload.v = (99, 0);
        let encoded = payload.encode();
        assert_eq!(
            DistributedTracePayload::decode(&encoded),
            Err(DtPayloadError::UnsupportedVersion(99, 0))
        );
    }
}
