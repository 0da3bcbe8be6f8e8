//! The HTTPS JSON-RPC collector client (§4.5).

use std::io::Write as _;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::Client;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::domain_types::RunId;
use crate::error::CollectorError;

use super::wire::ResponseEnvelope;

/// Request body is gzipped once it exceeds this size (§4.5).
const GZIP_THRESHOLD_BYTES: usize = 2 * 1024;

/// Total request timeout, including connect, per §4.5.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const PROTOCOL_VERSION: u32 = 17;

/// Thin wrapper over a shared [`reqwest::Client`] implementing the collector's
/// `invoke_raw_method` RPC shape.
#[derive(Debug, Clone)]
pub struct CollectorClient {
    http: Client,
}

impl CollectorClient {
    /// Builds a client with the agent's fixed request timeout.
    ///
    /// # Panics
    ///
    /// Panics if the underlying TLS backend fails to initialize, matching
    /// `reqwest::Client::new`'s own panic contract.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("collector HTTP client builds with default TLS backend"),
        }
    }

    /// Calls one collector RPC method with a JSON body, gzipping it first if
    /// it exceeds [`GZIP_THRESHOLD_BYTES`].
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError`] classified per §7 from the HTTP status, or
    /// [`CollectorError::Transient`] on network failure.
    #[instrument(skip(self, body), fields(method = method))]
    pub async fn invoke(
        &self,
        host: &str,
        method: &str,
        license_key: &str,
        run_id: Option<&RunId>,
        body: &[Value],
    ) -> Result<Value, CollectorError> {
        let url = self.build_url(host, method, license_key, run_id);
        let json = serde_json::to_vec(body).map_err(|e| CollectorError::Transient(e.to_string()))?;

        let mut request = self.http.post(url).header("Content-Type", "application/json");
        if json.len() > GZIP_THRESHOLD_BYTES {
            let compressed = gzip(&json).map_err(|e| CollectorError::Transient(e.to_string()))?;
            request = request.header("Content-Encoding", "gzip").body(compressed);
        } else {
            request = request.body(json);
        }

        let response = request.send().await.map_err(|e| CollectorError::Transient(e.to_string()))?;
        let status = response.status().as_u16();
        let body_text = response.text().await.unwrap_or_default();

        if let Some(error) = CollectorError::classify_status(status, Some(&body_text)) {
            warn!(status, method, "collector rejected request");
            return Err(error);
        }

        let envelope: ResponseEnvelope =
            serde_json::from_str(&body_text).map_err(|e| CollectorError::Transient(e.to_string()))?;
        match envelope {
            ResponseEnvelope::Success { return_value } => Ok(return_value),
            ResponseEnvelope::Exception { exception } => {
                Err(CollectorError::Transient(exception.message))
            }
        }
    }

    fn build_url(&self, host: &str, method: &str, license_key: &str, run_id: Option<&RunId>) -> String {
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{host}")
        };
        let mut url = format!(
            "{base}/agent_listener/invoke_raw_method?method={method}&license_key={license_key}&marshal_format=json&protocol_version={PROTOCOL_VERSION}"
        );
        if let Some(run_id) = run_id {
            url.push_str(&format!("&run_id={run_id}"));
        }
        url
    }
}

impl Default for CollectorClient {
    fn default() -> Self {
        Self::new()
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn successful_invoke_returns_the_return_value() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent_listener/invoke_raw_method"))
            .and(query_param("method", "preconnect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "return_value": { "redirect_host": "collector-1.example.com" }
            })))
            .mount(&server)
            .await;

        let client = CollectorClient::new();
        let result = client
            .invoke(&server.uri(), "preconnect", "license", None, &[Value::Null])
            .await
            .unwrap();
        assert_eq!(result["redirect_host"], "collector-1.example.com");
    }

    #[tokio::test]
    async fn license_error_status_is_classified_before_parsing_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent_listener/invoke_raw_method"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid license"))
            .mount(&server)
            .await;

        let client = CollectorClient::new();
        let result = client.invoke(&server.uri(), "connect", "license", None, &[Value::Null]).await;
        assert_eq!(result, Err(CollectorError::InvalidLicense));
    }

    #[test]
    fn gzip_round_trips_through_flate2() {
        let data = b"a".repeat(GZIP_THRESHOLD_BYTES + 1);
        let compressed = gzip(&data).unwrap();
        assert!(compressed.len() < data.len());
    }

    #[test]
    fn classifies_license_error_status() {
        assert_eq!(CollectorError::classify_status(401, None), Some(CollectorError::InvalidLicense));
    }
}
