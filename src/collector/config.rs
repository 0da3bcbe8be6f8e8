//! Agent configuration: defaults, environment variables, then explicit
//! builder calls, in that precedence order (§10.3).

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use crate::domain_types::{AppName, LicenseKey};
use crate::error::ConfigError;

const ENV_LICENSE_KEY: &str = "NEW_RELIC_LICENSE_KEY";
const ENV_APP_NAME: &str = "NEW_RELIC_APP_NAME";
const ENV_HOST: &str = "NEW_RELIC_HOST";
const ENV_LOG_LEVEL: &str = "NEW_RELIC_LOG_LEVEL";
const ENV_HIGH_SECURITY: &str = "NEW_RELIC_HIGH_SECURITY";
const ENV_DISTRIBUTED_TRACING_ENABLED: &str = "NEW_RELIC_DISTRIBUTED_TRACING_ENABLED";
const ENV_METADATA_PREFIX: &str = "NEW_RELIC_METADATA_";
const ENV_PROCESS_HOST_DISPLAY_NAME: &str = "NEW_RELIC_PROCESS_HOST_DISPLAY_NAME";
const ENV_TRANSACTION_TRACER_THRESHOLD_SECONDS: &str = "NEW_RELIC_TRANSACTION_TRACER_THRESHOLD_SECONDS";

const DEFAULT_HOST: &str = "collector.newrelic.com";

/// Default transaction-tracer duration threshold (§4.3 "Trace bucket"),
/// compared against `4 x apdexThreshold` at harvest time; the larger of the
/// two wins.
const DEFAULT_TRACER_THRESHOLD: Duration = Duration::from_millis(500);

/// Fully resolved agent configuration, ready to drive the connector task.
#[derive(Debug, Clone)]
pub struct Config {
    pub license_key: LicenseKey,
    pub app_name: AppName,
    pub host: String,
    pub log_level: String,
    pub high_security: bool,
    pub distributed_tracing_enabled: bool,
    /// `NEW_RELIC_METADATA_*` values, keys and values passed through
    /// verbatim (original case preserved; see DESIGN.md for the rationale).
    pub metadata: BTreeMap<String, String>,
    pub process_host_display_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Locally configured transaction-trace duration threshold
    /// (`tracerThreshold.duration` in §4.3); compared against `4 x apdexThreshold`
    /// with the larger value winning.
    pub tracer_threshold: Duration,
}

/// Builds a [`Config`] from defaults, then environment variables, then
/// explicit overrides, each layer taking precedence over the last.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    license_key: Option<String>,
    app_name: Option<String>,
    host: Option<String>,
    log_level: Option<String>,
    high_security: Option<bool>,
    distributed_tracing_enabled: Option<bool>,
    metadata: BTreeMap<String, String>,
    process_host_display_name: Option<String>,
    labels: BTreeMap<String, String>,
    tracer_threshold: Option<Duration>,
}

impl ConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Populates the builder from the process environment, matching the
    /// `NEW_RELIC_*` variables in §6. Values already set by an earlier
    /// explicit call are left untouched.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.license_key.is_none() {
            self.license_key = env::var(ENV_LICENSE_KEY).ok();
        }
        if self.app_name.is_none() {
            self.app_name = env::var(ENV_APP_NAME).ok();
        }
        if self.host.is_none() {
            self.host = env::var(ENV_HOST).ok();
        }
        if self.log_level.is_none() {
            self.log_level = env::var(ENV_LOG_LEVEL).ok();
        }
        if self.high_security.is_none() {
            self.high_security = env::var(ENV_HIGH_SECURITY).ok().map(|v| v == "true" || v == "1");
        }
        if self.distributed_tracing_enabled.is_none() {
            self.distributed_tracing_enabled =
                env::var(ENV_DISTRIBUTED_TRACING_ENABLED).ok().map(|v| v != "false" && v != "0");
        }
        if self.process_host_display_name.is_none() {
            self.process_host_display_name = env::var(ENV_PROCESS_HOST_DISPLAY_NAME).ok();
        }
        if self.tracer_threshold.is_none() {
            self.tracer_threshold = env::var(ENV_TRANSACTION_TRACER_THRESHOLD_SECONDS)
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .map(Duration::from_secs_f64);
        }
        for (key, value) in env::vars() {
            if let Some(suffix) = key.strip_prefix(ENV_METADATA_PREFIX) {
                self.metadata.entry(suffix.to_string()).or_insert(value);
            }
        }
        self
    }

    #[must_use]
    pub fn license_key(mut self, value: impl Into<String>) -> Self {
        self.license_key = Some(value.into());
        self
    }

    #[must_use]
    pub fn app_name(mut self, value: impl Into<String>) -> Self {
        self.app_name = Some(value.into());
        self
    }

    #[must_use]
    pub fn host(mut self, value: impl Into<String>) -> Self {
        self.host = Some(value.into());
        self
    }

    #[must_use]
    pub fn high_security(mut self, value: bool) -> Self {
        self.high_security = Some(value);
        self
    }

    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn tracer_threshold(mut self, value: Duration) -> Self {
        self.tracer_threshold = Some(value);
        self
    }

    /// Validates and finalizes the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if the license key or app name was
    /// never supplied, or [`ConfigError::Invalid`] if a supplied value fails
    /// validation.
    pub fn build(self) -> Result<Config, ConfigError> {
        let license_key = self.license_key.ok_or(ConfigError::Missing("license_key"))?;
        let license_key = LicenseKey::try_new(license_key).map_err(|e| ConfigError::Invalid {
            field: "license_key",
            reason: e.to_string(),
        })?;

        let app_name = self.app_name.ok_or(ConfigError::Missing("app_name"))?;
        let app_name = AppName::try_new(app_name).map_err(|e| ConfigError::Invalid {
            field: "app_name",
            reason: e.to_string(),
        })?;

        Ok(Config {
            license_key,
            app_name,
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            high_security: self.high_security.unwrap_or(false),
            distributed_tracing_enabled: self.distributed_tracing_enabled.unwrap_or(true),
            metadata: self.metadata,
            process_host_display_name: self.process_host_display_name,
            labels: self.labels,
            tracer_threshold: self.tracer_threshold.unwrap_or(DEFAULT_TRACER_THRESHOLD),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_license_key_is_reported() {
        let result = ConfigBuilder::new().app_name("app").build();
        assert_eq!(result.unwrap_err(), ConfigError::Missing("license_key"));
    }

    #[test]
    fn explicit_values_take_precedence_over_defaults() {
        let config = ConfigBuilder::new()
            .license_key("abcd1234")
            .app_name("my-app")
            .host("custom.collector.example.com")
            .build()
            .unwrap();
        assert_eq!(config.host, "custom.collector.example.com");
        assert_eq!(config.app_name.to_string(), "my-app");
    }

    #[test]
    fn defaults_fill_in_unset_host() {
        let config = ConfigBuilder::new().license_key("abcd1234").app_name("my-app").build().unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn empty_app_name_is_rejected() {
        let result = ConfigBuilder::new().license_key("abcd1234").app_name("").build();
        assert!(matches!(result, Err(ConfigError::Invalid { field: "app_name", .. })));
    }

    #[test]
    fn tracer_threshold_defaults_when_unset() {
        let config = ConfigBuilder::new().license_key("abcd1234").app_name("my-app").build().unwrap();
        assert_eq!(config.tracer_threshold, DEFAULT_TRACER_THRESHOLD);
    }

    #[test]
    fn explicit_tracer_threshold_overrides_the_default() {
        let config = ConfigBuilder::new()
            .license_key("abcd1234")
            .app_name("my-app")
            .tracer_threshold(Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(config.tracer_threshold, Duration::from_secs(2));
    }
}
