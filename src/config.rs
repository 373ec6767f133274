//! Coordinator configuration
//!
//! Every field has a default; `from_env` overlays `CAPTURE_*` variables.

use crate::utils::error::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const ENV_PREFIX: &str = "CAPTURE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Base URL of the Capture API (`/captures` is appended)
    pub api_base_url: String,

    /// Signaling endpoint; defaults to `<api_base_url>/webrtc`
    pub signaling_url: Option<String>,

    pub request_timeout_ms: u64,

    /// Budget for one negotiation attempt
    pub negotiation_timeout_ms: u64,

    /// Total tries when the gateway is unavailable
    pub negotiation_attempts: u32,

    pub retry_backoff_ms: u64,

    pub poll_interval_ms: u64,

    /// Broadcast buffer for registry events
    pub event_capacity: usize,

    pub retain_terminal_per_workshop: usize,

    /// When false a second active task only logs a warning
    pub enforce_single_active: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            signaling_url: None,
            request_timeout_ms: 30_000,
            negotiation_timeout_ms: 5_000,
            negotiation_attempts: 1,
            retry_backoff_ms: 250,
            poll_interval_ms: 5_000,
            event_capacity: 100,
            retain_terminal_per_workshop: 50,
            enforce_single_active: true,
        }
    }
}

impl CoordinatorConfig {
    /// Load from `CAPTURE_*` environment variables on top of the defaults
    pub fn from_env() -> CaptureResult<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| CaptureError::Config(e.to_string()))?;
        config.normalize().validate()
    }

    fn normalize(mut self) -> Self {
        self.api_base_url = self.api_base_url.trim().trim_end_matches('/').to_string();
        self.signaling_url = self
            .signaling_url
            .take()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        self
    }

    pub fn validate(self) -> CaptureResult<Self> {
        if self.request_timeout_ms == 0 || self.negotiation_timeout_ms == 0 {
            return Err(CaptureError::Config("timeouts must be non-zero".into()));
        }
        if self.negotiation_attempts == 0 {
            return Err(CaptureError::Config(
                "negotiation_attempts must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 || self.event_capacity == 0 {
            return Err(CaptureError::Config(
                "poll_interval_ms and event_capacity must be non-zero".into(),
            ));
        }
        self.api_base()?;
        self.signaling_endpoint()?;
        Ok(self)
    }

    /// Capture API base with a trailing slash so joins append
    pub fn api_base(&self) -> CaptureResult<Url> {
        parse_url(&format!("{}/", self.api_base_url.trim_end_matches('/')))
    }

    pub fn signaling_endpoint(&self) -> CaptureResult<Url> {
        match &self.signaling_url {
            Some(url) => parse_url(url),
            None => self
                .api_base()?
                .join("webrtc")
                .map_err(|e| CaptureError::Config(e.to_string())),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Shared HTTP client honouring `request_timeout_ms`
    pub fn http_client(&self) -> CaptureResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.request_timeout())
            .build()
            .map_err(|e| CaptureError::Config(e.to_string()))
    }
}

fn parse_url(raw: &str) -> CaptureResult<Url> {
    Url::parse(raw).map_err(|e| CaptureError::Config(format!("invalid url {raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoints() {
        let config = CoordinatorConfig::default().validate().unwrap();
        assert_eq!(config.api_base().unwrap().as_str(), "http://localhost:8080/api/");
        assert_eq!(
            config.signaling_endpoint().unwrap().as_str(),
            "http://localhost:8080/api/webrtc"
        );
    }

    #[test]
    fn test_explicit_signaling_url() {
        let config = CoordinatorConfig {
            signaling_url: Some("http://gateway:9000/offer".into()),
            ..Default::default()
        };
        assert_eq!(
            config.signaling_endpoint().unwrap().as_str(),
            "http://gateway:9000/offer"
        );
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let config = CoordinatorConfig {
            negotiation_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CaptureError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_url() {
        let config = CoordinatorConfig {
            api_base_url: "not a url".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_normalize_trims_trailing_slash() {
        let config = CoordinatorConfig {
            api_base_url: "http://host/api/".into(),
            signaling_url: Some("  ".into()),
            ..Default::default()
        }
        .normalize();
        assert_eq!(config.api_base_url, "http://host/api");
        assert_eq!(config.signaling_url, None);
    }
}
