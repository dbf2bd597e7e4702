//! Application configuration.
//!
//! A plain deserializable struct with sensible defaults; deployments load
//! overrides from TOML. Only the knobs the lifecycle engine consults live
//! here — collaborator components carry their own configuration.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default cap on buffered request bodies (16 MB).
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Framework configuration for one application.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Maximum accepted request body size in bytes; `None` disables the cap.
    pub max_content_length: Option<usize>,
    /// Timeout for whole-body reads, seconds; `None` disables it.
    pub body_timeout: Option<u64>,
    /// Timeout for streaming a response back to the transport, seconds;
    /// `None` disables it. A per-response override takes precedence.
    pub response_timeout: Option<u64>,
    /// Re-raise unhandled handler errors instead of converting them to a
    /// 500 response. Used by debug tooling that renders tracebacks.
    pub propagate_exceptions: bool,
    /// Leave HTTP-domain errors to the generic error path instead of their
    /// status-specific handling.
    pub trap_http_errors: bool,
    /// Host name used when a pre-1.1 request carries no `Host` header.
    pub server_name: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_content_length: Some(DEFAULT_MAX_CONTENT_LENGTH),
            body_timeout: Some(60),
            response_timeout: Some(60),
            propagate_exceptions: false,
            trap_http_errors: false,
            server_name: None,
        }
    }
}

impl AppConfig {
    /// Parse a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn body_timeout_duration(&self) -> Option<Duration> {
        self.body_timeout.map(Duration::from_secs)
    }

    pub fn response_timeout_duration(&self) -> Option<Duration> {
        self.response_timeout.map(Duration::from_secs)
    }
}
