//! Admin API, served on its own listener.
//!
//! # Data Flow
//! ```text
//! GET /admin/*
//!     → auth.rs (Bearer key check)
//!     → handlers.rs (status, tracked clients, active policy)
//! ```

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{middleware, routing::get, Router};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::security::moderation::ContentModerator;
use crate::security::rate_limit::RateLimiter;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub api_key: Arc<str>,
    pub limiter: Arc<RateLimiter>,
    pub moderator: Arc<ContentModerator>,
    pub started: Instant,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/clients", get(get_clients))
        .route("/admin/policy", get(get_policy))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
