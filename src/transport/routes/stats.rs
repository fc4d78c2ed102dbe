use std::sync::Arc;

use axum::{
    extract::State,
    response::Json,
};
use serde::Serialize;

use crate::monitoring::collect_stats;
use crate::protocol::messages::RelayStats;
use crate::server::AppState;

/// GET /v1/stats
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<RelayStats> {
    Json(collect_stats(&state))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    pub build_time: u64,
    pub git_branch: String,
    pub git_commit: String,
}

/// GET /version
pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        build_time: env!("BUILD_TIME").parse().unwrap_or(0),
        git_branch: env!("GIT_BRANCH").to_string(),
        git_commit: env!("GIT_COMMIT").to_string(),
    })
}
