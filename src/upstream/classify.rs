//! Upstream error classification.
//!
//! Every upstream failure maps to exactly one [`ErrorKind`] through an ordered
//! rule list; the first matching rule wins and anything unmatched is
//! `UNKNOWN`. New provider error shapes are supported by adding a rule.
//! Each kind has a fixed HTTP status and caller-facing message, so provider
//! wording never leaks to the caller.

use std::fmt;
use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::schema::UpstreamConfig;
use crate::security::identity::ClientIdentity;
use crate::upstream::UpstreamError;

/// Closed taxonomy of upstream failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RateLimit,
    ContextLength,
    ContentFilter,
    AuthError,
    Timeout,
    Validation,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::ContextLength => "CONTEXT_LENGTH",
            ErrorKind::ContentFilter => "CONTENT_FILTER",
            ErrorKind::AuthError => "AUTH_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Only provider rate limits and timeouts are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimit | ErrorKind::Timeout)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ContextLength | ErrorKind::ContentFilter | ErrorKind::Validation => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::AuthError | ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Caller-facing message for this kind.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "The AI service is busy right now. Please try again shortly.",
            ErrorKind::ContextLength => {
                "This conversation is too long for the model. Start a new conversation or shorten your message."
            }
            ErrorKind::ContentFilter => "The AI provider declined this request under its content policy.",
            ErrorKind::AuthError => "The AI service is temporarily unavailable.",
            ErrorKind::Timeout => "The AI service took too long to respond. Please try again.",
            ErrorKind::Validation => "The AI service could not process this request.",
            ErrorKind::Unknown => "Something went wrong while generating a response. Please try again.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Predicate = fn(&UpstreamError) -> bool;

/// Ordered (predicate, kind) rules. First match wins.
const RULES: &[(Predicate, ErrorKind)] = &[
    (is_auth, ErrorKind::AuthError),
    (is_rate_limit, ErrorKind::RateLimit),
    (is_context_length, ErrorKind::ContextLength),
    (is_content_filter, ErrorKind::ContentFilter),
    (is_timeout, ErrorKind::Timeout),
    (is_validation, ErrorKind::Validation),
];

fn signal_matches(err: &UpstreamError, codes: &[&str], phrases: &[&str]) -> bool {
    let code_hit = [err.code(), err.error_type()]
        .into_iter()
        .flatten()
        .any(|c| codes.iter().any(|k| c.eq_ignore_ascii_case(k)));
    if code_hit {
        return true;
    }
    let message = err.message().to_ascii_lowercase();
    phrases.iter().any(|p| message.contains(p))
}

fn is_auth(err: &UpstreamError) -> bool {
    matches!(err.status(), Some(401 | 403))
        || signal_matches(
            err,
            &["invalid_api_key", "authentication_error", "permission_error", "unauthorized"],
            &["incorrect api key", "invalid api key", "invalid authentication", "unauthorized"],
        )
}

fn is_rate_limit(err: &UpstreamError) -> bool {
    err.status() == Some(429)
        || signal_matches(
            err,
            &["rate_limit_exceeded", "rate_limit_error", "overloaded_error"],
            &["rate limit", "too many requests"],
        )
}

fn is_context_length(err: &UpstreamError) -> bool {
    err.status() == Some(413)
        || signal_matches(
            err,
            &["context_length_exceeded", "string_above_max_length"],
            &[
                "context length",
                "context_length_exceeded",
                "maximum context",
                "prompt is too long",
                "too many tokens",
            ],
        )
}

fn is_content_filter(err: &UpstreamError) -> bool {
    signal_matches(
        err,
        &["content_filter", "content_policy_violation"],
        &["content policy", "content management policy", "content filter", "safety system"],
    )
}

fn is_timeout(err: &UpstreamError) -> bool {
    matches!(err, UpstreamError::Timeout(_))
        || matches!(err.status(), Some(408 | 504))
        || signal_matches(err, &["timeout"], &["timed out", "deadline exceeded"])
}

fn is_validation(err: &UpstreamError) -> bool {
    matches!(err.status(), Some(400 | 422))
}

/// A classified upstream failure. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: &'static str,
    pub cause: UpstreamError,
    pub retryable: bool,
    /// Seconds the caller should wait, for retryable kinds.
    pub retry_after: Option<u64>,
}

impl ApiError {
    /// Body shared by the JSON response and the SSE error event.
    pub fn body(&self) -> Value {
        let mut body = json!({
            "error": self.message,
            "type": self.kind.as_str(),
            "retryable": self.retryable,
        });
        if let Some(secs) = self.retry_after {
            body["retryAfter"] = json!(secs);
        }
        body
    }

    /// Log kind, duration and client. The upstream text goes to the log only.
    pub fn log(&self, client: &ClientIdentity, request_id: &str, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        if self.kind == ErrorKind::AuthError {
            tracing::error!(
                request_id = %request_id,
                client = %client,
                kind = %self.kind,
                elapsed_ms,
                cause = %self.cause,
                "Upstream rejected gateway credentials; check deployment configuration"
            );
        } else {
            tracing::warn!(
                request_id = %request_id,
                client = %client,
                kind = %self.kind,
                elapsed_ms,
                retryable = self.retryable,
                cause = %self.cause,
                "Upstream completion failed"
            );
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.kind.status(), Json(self.body())).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Applies [`RULES`] and attaches retry guidance.
#[derive(Debug, Clone, Copy)]
pub struct ErrorClassifier {
    rate_limit_retry_after: u64,
    timeout_retry_after: u64,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::from_config(&UpstreamConfig::default())
    }
}

impl ErrorClassifier {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            rate_limit_retry_after: config.rate_limit_retry_after_secs,
            timeout_retry_after: config.timeout_retry_after_secs,
        }
    }

    /// Kind for an error. Total and deterministic.
    pub fn kind_of(err: &UpstreamError) -> ErrorKind {
        RULES
            .iter()
            .find(|(rule, _)| rule(err))
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    pub fn classify(&self, err: UpstreamError) -> ApiError {
        let kind = Self::kind_of(&err);
        let retry_after = match kind {
            ErrorKind::RateLimit => Some(err.retry_after().unwrap_or(self.rate_limit_retry_after)),
            ErrorKind::Timeout => Some(err.retry_after().unwrap_or(self.timeout_retry_after)),
            _ => None,
        };

        ApiError {
            kind,
            message: kind.user_message(),
            retryable: kind.is_retryable(),
            retry_after,
            cause: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16, message: &str, code: Option<&str>) -> UpstreamError {
        UpstreamError::Status {
            status,
            message: message.to_string(),
            code: code.map(str::to_string),
            error_type: None,
            retry_after: None,
        }
    }

    #[test]
    fn test_context_length_is_not_retryable_400() {
        let err = status(
            400,
            "This model's maximum context length is 8192 tokens. However, your messages resulted in 9000 tokens.",
            Some("context_length_exceeded"),
        );
        let api = ErrorClassifier::default().classify(err);

        assert_eq!(api.kind, ErrorKind::ContextLength);
        assert!(!api.retryable);
        assert_eq!(api.kind.status(), StatusCode::BAD_REQUEST);
        assert_eq!(api.retry_after, None);
        assert!(!api.body()["error"].as_str().unwrap().contains("8192"));
    }

    #[test]
    fn test_rule_order_first_match_wins() {
        // 401 whose text mentions rate limits is still an auth problem.
        assert_eq!(
            ErrorClassifier::kind_of(&status(401, "rate limit on invalid key", None)),
            ErrorKind::AuthError
        );
        // 429 quoting the context length is a rate limit.
        assert_eq!(
            ErrorClassifier::kind_of(&status(429, "context length", None)),
            ErrorKind::RateLimit
        );
        // A 400 with no known signal falls through to validation.
        assert_eq!(
            ErrorClassifier::kind_of(&status(400, "unsupported parameter", None)),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_taxonomy_by_signal() {
        let cases = [
            (status(403, "", None), ErrorKind::AuthError),
            (status(500, "Incorrect API key provided", None), ErrorKind::AuthError),
            (status(429, "slow down", None), ErrorKind::RateLimit),
            (
                UpstreamError::Stream {
                    message: "x".to_string(),
                    code: Some("content_filter".to_string()),
                    error_type: None,
                },
                ErrorKind::ContentFilter,
            ),
            (
                status(400, "The response was filtered due to our content management policy", None),
                ErrorKind::ContentFilter,
            ),
            (UpstreamError::Timeout("idle".to_string()), ErrorKind::Timeout),
            (status(504, "gateway", None), ErrorKind::Timeout),
            (UpstreamError::Transport("connection refused".to_string()), ErrorKind::Unknown),
            (UpstreamError::Protocol("bad chunk".to_string()), ErrorKind::Unknown),
            (status(502, "Bad Gateway", None), ErrorKind::Unknown),
        ];
        for (err, expected) in cases {
            assert_eq!(ErrorClassifier::kind_of(&err), expected, "{err}");
            // Deterministic
            assert_eq!(ErrorClassifier::kind_of(&err), ErrorClassifier::kind_of(&err.clone()));
        }
    }

    #[test]
    fn test_retry_guidance() {
        let classifier = ErrorClassifier::default();

        let provider_hint = classifier.classify(UpstreamError::Status {
            status: 429,
            message: String::new(),
            code: None,
            error_type: None,
            retry_after: Some(7),
        });
        assert!(provider_hint.retryable);
        assert_eq!(provider_hint.retry_after, Some(7));

        let timeout = classifier.classify(UpstreamError::Timeout("t".to_string()));
        assert_eq!(timeout.retry_after, Some(5));
        assert_eq!(timeout.body()["retryAfter"], 5);

        let auth = classifier.classify(status(401, "", None));
        assert!(!auth.retryable);
        assert!(auth.body().get("retryAfter").is_none());
    }

    #[test]
    fn test_into_response_sets_status_and_header() {
        let api = ErrorClassifier::default().classify(status(429, "", None));
        let response = api.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
    }
}
