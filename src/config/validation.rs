//! Configuration validation.
//!
//! Serde handles syntax; this pass checks value ranges and cross-field
//! constraints. Every problem is reported, not just the first.

use std::net::SocketAddr;

use regex::Regex;
use url::Url;

use crate::config::schema::{GatewayConfig, ADMIN_KEY_PLACEHOLDER};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if !config.listener.chat_path.starts_with('/') {
        errors.push(ValidationError::new("listener.chat_path", "must start with '/'"));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }
    if config.timeouts.upstream_connect_secs == 0 {
        errors.push(ValidationError::new(
            "timeouts.upstream_connect_secs",
            "must be greater than 0",
        ));
    }
    if config.timeouts.upstream_idle_secs == 0 {
        errors.push(ValidationError::new(
            "timeouts.upstream_idle_secs",
            "must be greater than 0",
        ));
    }

    let rl = &config.rate_limit;
    if rl.limit == 0 {
        errors.push(ValidationError::new("rate_limit.limit", "must be greater than 0"));
    }
    if rl.window_ms == 0 {
        errors.push(ValidationError::new("rate_limit.window_ms", "must be greater than 0"));
    }
    if rl.max_tracked_clients == 0 {
        errors.push(ValidationError::new(
            "rate_limit.max_tracked_clients",
            "must be greater than 0",
        ));
    }
    if rl.sweep_interval_secs == 0 {
        errors.push(ValidationError::new(
            "rate_limit.sweep_interval_secs",
            "must be greater than 0",
        ));
    }

    let payload = &config.payload;
    if payload.max_body_bytes == 0 {
        errors.push(ValidationError::new("payload.max_body_bytes", "must be greater than 0"));
    }
    if payload.max_content_chars == 0 {
        errors.push(ValidationError::new(
            "payload.max_content_chars",
            "must be greater than 0",
        ));
    }
    if payload.max_history < 2 {
        errors.push(ValidationError::new(
            "payload.max_history",
            "must keep at least 2 messages (system message plus latest turn)",
        ));
    }
    if payload.max_history > payload.max_messages {
        errors.push(ValidationError::new(
            "payload.max_history",
            format!("must not exceed payload.max_messages ({})", payload.max_messages),
        ));
    }

    for pattern in &config.sanitizer.extra_patterns {
        if let Err(e) = Regex::new(pattern) {
            errors.push(ValidationError::new(
                "sanitizer.extra_patterns",
                format!("invalid pattern '{}': {}", pattern, e),
            ));
        }
    }

    match Url::parse(&config.upstream.base_url) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => errors.push(ValidationError::new(
            "upstream.base_url",
            format!("unsupported scheme '{}'", url.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new(
            "upstream.base_url",
            format!("'{}' is not a URL: {}", config.upstream.base_url, e),
        )),
    }
    if config.upstream.model.trim().is_empty() {
        errors.push(ValidationError::new("upstream.model", "must not be empty"));
    }
    for tool in &config.upstream.tools {
        if tool.name.trim().is_empty() {
            errors.push(ValidationError::new("upstream.tools", "tool name must not be empty"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if config.admin.enabled {
        if config.admin.api_key.is_empty() || config.admin.api_key == ADMIN_KEY_PLACEHOLDER {
            errors.push(ValidationError::new(
                "admin.api_key",
                "must be set when the admin API is enabled",
            ));
        }
        if config.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "admin.bind_address",
                format!("'{}' is not a socket address", config.admin.bind_address),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
