use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::security::rate_limit::ClientUsage;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub policy_version: String,
    pub moderation_enabled: bool,
    pub rate_limit_enabled: bool,
}

#[derive(Serialize)]
pub struct ClientsSummary {
    pub limit: u32,
    pub window_ms: u64,
    pub tracked: usize,
    pub clients: Vec<ClientUsage>,
}

#[derive(Serialize)]
pub struct PolicySummary {
    pub version: String,
    pub categories: Vec<String>,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        policy_version: state.moderator.policy_version(),
        moderation_enabled: state.moderator.is_enabled(),
        rate_limit_enabled: state.limiter.is_enabled(),
    })
}

pub async fn get_clients(State(state): State<AdminState>) -> Json<ClientsSummary> {
    Json(ClientsSummary {
        limit: state.limiter.limit(),
        window_ms: state.limiter.window().as_millis() as u64,
        tracked: state.limiter.tracked_clients(),
        clients: state.limiter.usage(),
    })
}

pub async fn get_policy(State(state): State<AdminState>) -> Json<PolicySummary> {
    let policy = state.moderator.policy();
    Json(PolicySummary {
        version: policy.version().to_string(),
        categories: policy.categories().to_vec(),
    })
}
