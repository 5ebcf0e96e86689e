//! Response shaping.
//!
//! Every response that follows an admission decision carries the
//! rate-limit headers, whatever its status. Rejections become fixed JSON
//! bodies; a successful completion becomes an SSE stream that ends with
//! either `event: done` or `event: error`.

use std::convert::Infallible;
use std::time::Instant;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;

use crate::observability::metrics;
use crate::pipeline::Rejection;
use crate::security::identity::ClientIdentity;
use crate::security::rate_limit::RateLimitResult;
use crate::upstream::{ApiError, ChunkStream, ErrorClassifier, UpstreamError};

pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub const MALFORMED_JSON: &str = "Invalid JSON in request body";
pub const INVALID_REQUEST: &str = "Invalid request";
pub const TOO_MANY_REQUESTS: &str = "Too many requests. Please wait before sending more messages.";

/// Write remaining budget and seconds until the window resets.
pub fn set_rate_limit_headers(headers: &mut HeaderMap, rate: &RateLimitResult) {
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(rate.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(rate.reset_in_ms.div_ceil(1000)));
}

/// Attach rate-limit headers to any response.
pub fn with_rate_limit(mut response: Response, rate: &RateLimitResult) -> Response {
    set_rate_limit_headers(response.headers_mut(), rate);
    response
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let response = match &self {
            Rejection::RateLimited { rate } => {
                let retry_after = rate.retry_after_secs();
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "error": TOO_MANY_REQUESTS, "retryAfter": retry_after })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            Rejection::TooLarge { limit, .. } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": format!("Request body exceeds {limit} bytes") })),
            )
                .into_response(),
            Rejection::MalformedJson { .. } => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": MALFORMED_JSON }))).into_response()
            }
            Rejection::Invalid { result, .. } => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": INVALID_REQUEST, "details": result.details() })),
            )
                .into_response(),
            Rejection::Blocked { moderation, .. } => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": moderation.policy_message(), "blocked": true })),
            )
                .into_response(),
        };
        with_rate_limit(response, self.rate())
    }
}

/// Per-request context needed once the stream has started.
pub struct StreamContext {
    pub classifier: ErrorClassifier,
    pub identity: ClientIdentity,
    pub request_id: String,
    pub started: Instant,
}

impl StreamContext {
    /// Classify, log and count a failure.
    pub fn fail(&self, err: UpstreamError) -> ApiError {
        let api = self.classifier.classify(err);
        api.log(&self.identity, &self.request_id, self.started.elapsed());
        metrics::record_upstream_error(api.kind.as_str());
        api
    }
}

/// SSE event carrying an upstream failure, same body as the JSON response.
pub fn error_event(api: &ApiError) -> Event {
    Event::default().event("error").data(api.body().to_string())
}

fn text_event(text: &str) -> Event {
    // Event::data rejects carriage returns.
    if text.contains('\r') {
        Event::default().data(text.replace('\r', ""))
    } else {
        Event::default().data(text)
    }
}

struct SseState {
    chunks: ChunkStream,
    ctx: StreamContext,
    finished: bool,
    sent: usize,
}

/// Map upstream chunks to SSE events. Stops after the first error.
pub fn sse_events(
    chunks: ChunkStream,
    ctx: StreamContext,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let state = SseState {
        chunks,
        ctx,
        finished: false,
        sent: 0,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        let event = match state.chunks.next().await {
            Some(Ok(text)) => {
                state.sent += 1;
                text_event(&text)
            }
            Some(Err(err)) => {
                state.finished = true;
                error_event(&state.ctx.fail(err))
            }
            None => {
                state.finished = true;
                tracing::debug!(
                    request_id = %state.ctx.request_id,
                    chunks = state.sent,
                    elapsed_ms = state.ctx.started.elapsed().as_millis() as u64,
                    "Completion stream finished"
                );
                Event::default().event("done").data("[DONE]")
            }
        };
        Some((Ok::<_, Infallible>(event), state))
    })
}

/// 200 streaming response with rate-limit headers.
pub fn stream_response(chunks: ChunkStream, ctx: StreamContext, rate: &RateLimitResult) -> Response {
    let sse = Sse::new(sse_events(chunks, ctx)).keep_alive(KeepAlive::default());
    with_rate_limit(sse.into_response(), rate)
}
