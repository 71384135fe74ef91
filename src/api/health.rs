//! 健康检查和部署状态 API
//!
//! 包含 /health, /status, /attempts/:mode 端点

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::domain::build::{BuildAttempt, BuildMode};
use crate::domain::lifecycle::DeploymentPhase;
use crate::domain::liveness::LivenessRecord;
use crate::domain::shell::ShellStatus;
use crate::error::{ApiError, ApiResult};
use crate::services::lifecycle::DeploymentStatus;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    phase: DeploymentPhase,
    /// 最近一次存活检测
    #[serde(skip_serializing_if = "Option::is_none")]
    liveness: Option<LivenessRecord>,
}

/// 完整状态响应
#[derive(Debug, Serialize)]
struct StatusResponse {
    service: &'static str,
    version: &'static str,
    hostname: String,
    started_at: String,
    config_root: String,
    store_corrupt: bool,
    deployment: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    liveness: Option<LivenessRecord>,
    shell: ShellStatus,
    active_log_streams: usize,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/attempts/:mode", get(last_attempt))
}

/// 健康检查
///
/// GET /health
/// 无需认证
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = chrono::Utc::now();
    Json(HealthResponse {
        status: "ok",
        service: "nix-deploy-agent",
        version: VERSION,
        timestamp: now.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        phase: state.lifecycle.phase(),
        liveness: state.liveness.last().await,
    })
}

/// 部署阶段、最近构建、存活检测与 shell 会话
///
/// GET /status
/// 无需认证
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = state.lifecycle.store();
    Json(StatusResponse {
        service: "nix-deploy-agent",
        version: VERSION,
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        started_at: state.started_at.to_rfc3339(),
        config_root: store.root().display().to_string(),
        store_corrupt: store.is_corrupt(),
        deployment: state.lifecycle.status(),
        liveness: state.liveness.last().await,
        shell: state.shell.status().await,
        active_log_streams: state.log_hub.active_count().await,
    })
}

/// 某种模式最近一次构建（含完整输出）
///
/// GET /attempts/:mode
/// 无需认证
async fn last_attempt(
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
) -> ApiResult<Json<BuildAttempt>> {
    let mode = BuildMode::parse(&mode)
        .ok_or_else(|| ApiError::bad_request(format!("unknown build mode '{}'", mode)))?;

    state
        .lifecycle
        .last_attempt(mode)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("{} attempt", mode)))
}
