//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the chat gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, chat endpoint path).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Per-client admission budget.
    pub rate_limit: RateLimitConfig,

    /// Conversation payload bounds.
    pub payload: PayloadConfig,

    /// Content moderation policy source.
    pub moderation: ModerationConfig,

    /// Prompt-injection sanitizer settings.
    pub sanitizer: SanitizerConfig,

    /// Upstream completion provider.
    pub upstream: UpstreamConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Path the chat endpoint is mounted on.
    pub chat_path: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            chat_path: "/api/chat".to_string(),
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed to produce response headers, in seconds.
    pub request_secs: u64,

    /// Upstream connection + first response timeout in seconds.
    pub upstream_connect_secs: u64,

    /// Maximum silence between streamed upstream chunks in seconds.
    pub upstream_idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 30,
            upstream_connect_secs: 10,
            upstream_idle_secs: 60,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Admissions allowed per client per window.
    pub limit: u32,

    /// Fixed window length in milliseconds.
    pub window_ms: u64,

    /// Soft cap on the number of client identities tracked at once.
    pub max_tracked_clients: usize,

    /// How often expired windows are swept, in seconds.
    pub sweep_interval_secs: u64,

    /// Derive client identity from X-Forwarded-For / X-Real-IP.
    /// Only enable behind a proxy that overwrites these headers.
    pub trust_forwarded_headers: bool,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 100,
            window_ms: 60_000,
            max_tracked_clients: 10_000,
            sweep_interval_secs: 60,
            trust_forwarded_headers: false,
        }
    }
}

/// Conversation payload bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Maximum accepted request body in bytes.
    pub max_body_bytes: usize,

    /// Hard upper bound on message count; more is a validation error.
    pub max_messages: usize,

    /// Maximum characters per message content.
    pub max_content_chars: usize,

    /// Messages kept after truncation (leading system message included).
    pub max_history: usize,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            max_messages: 1000,
            max_content_chars: 32_000,
            max_history: 50,
        }
    }
}

/// Moderation policy source.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModerationConfig {
    /// Enable content moderation.
    pub enabled: bool,

    /// Policy file (TOML). The built-in policy is used when unset.
    pub policy_path: Option<String>,

    /// Reload the policy file when it changes on disk.
    pub watch: bool,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy_path: None,
            watch: true,
        }
    }
}

/// Prompt-injection sanitizer settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SanitizerConfig {
    /// Extra regular expressions stripped alongside the built-in markers.
    pub extra_patterns: Vec<String>,
}

/// A tool definition passed through to the upstream model.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON schema of the tool arguments.
    #[serde(default = "default_tool_parameters")]
    pub parameters: serde_json::Value,
}

fn default_tool_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Upstream completion provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of an OpenAI-compatible API (e.g. "https://api.openai.com/v1").
    pub base_url: String,

    /// Model identifier sent with every completion.
    pub model: String,

    /// Environment variable holding the provider API key.
    pub api_key_env: String,

    /// System instruction prepended to every conversation.
    pub system_prompt: String,

    /// Completion token cap.
    pub max_tokens: Option<u32>,

    /// Retry guidance (seconds) for provider rate limits without Retry-After.
    pub rate_limit_retry_after_secs: u64,

    /// Retry guidance (seconds) after an upstream timeout.
    pub timeout_retry_after_secs: u64,

    /// Tool catalog offered to the model.
    pub tools: Vec<ToolConfig>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            system_prompt: "You are a helpful assistant.".to_string(),
            max_tokens: None,
            rate_limit_retry_after_secs: 30,
            timeout_retry_after_secs: 5,
            tools: Vec::new(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human readable or JSON log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Placeholder admin key; refused by validation when admin is enabled.
pub const ADMIN_KEY_PLACEHOLDER: &str = "CHANGE_ME_IN_PRODUCTION";

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: ADMIN_KEY_PLACEHOLDER.to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
