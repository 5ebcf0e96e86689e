//! POST handler for the chat endpoint.

use std::net::SocketAddr;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use tracing::Instrument;

use crate::http::request::request_id;
use crate::http::response::{stream_response, with_rate_limit, StreamContext};
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::pipeline::Rejection;
use crate::security::identity::RequestMetadata;
use crate::upstream::CompletionRequest;

/// Run the admission pipeline, then stream the completion back.
pub async fn chat_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let id = request_id(request.headers());
    let span = tracing::info_span!("chat", request_id = %id);
    handle(state, request, id).instrument(span).await
}

async fn handle(state: AppState, request: Request<Body>, request_id: String) -> Response {
    let started = Instant::now();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();

    let (identity, admission) = state.pipeline.admit(RequestMetadata {
        headers: &parts.headers,
        peer,
    });
    let rate = match admission {
        Ok(rate) => rate,
        Err(rejection) => return reject(rejection, started),
    };

    // Any read failure here is almost always the size limit.
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(client = %identity, error = %e, "Failed to read request body");
            let limit = state.max_body_bytes;
            return reject(Rejection::TooLarge { rate, limit }, started);
        }
    };

    let admitted = match state.pipeline.screen(identity, rate, &bytes) {
        Ok(admitted) => admitted,
        Err(rejection) => return reject(rejection, started),
    };
    if !admitted.warnings.is_empty() {
        tracing::info!(client = %admitted.identity, warnings = ?admitted.warnings, "Payload warnings");
    }

    let completion = CompletionRequest {
        system_prompt: state.completion.system_prompt.clone(),
        messages: admitted.messages,
        tools: state.completion.tools.clone(),
    };
    let ctx = StreamContext {
        classifier: state.classifier,
        identity: admitted.identity,
        request_id,
        started,
    };

    match state.provider.complete(completion).await {
        Ok(chunks) => {
            tracing::debug!(client = %ctx.identity, "Streaming completion");
            metrics::record_request("ok", 200, started);
            stream_response(chunks, ctx, &admitted.rate)
        }
        Err(err) => {
            let api = ctx.fail(err);
            let status = api.kind.status();
            metrics::record_request(api.kind.as_str(), status.as_u16(), started);
            with_rate_limit(api.into_response(), &admitted.rate)
        }
    }
}

fn reject(rejection: Rejection, started: Instant) -> Response {
    let outcome = rejection.outcome();
    let response = rejection.into_response();
    metrics::record_request(outcome, response.status().as_u16(), started);
    response
}
