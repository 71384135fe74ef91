//! 目标主机 API
//!
//! 包含 /livenessCheck, /fetchLocalUrl, /searchPackage, /shutdown 端点

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::domain::liveness::LivenessRecord;
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::services::search::SearchResult;
use crate::state::{trigger_shutdown, AppState};

/// 代理请求
#[derive(Debug, Deserialize)]
struct FetchRequest {
    url: String,
}

/// 创建目标主机路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/livenessCheck", get(liveness_check))
        .route("/fetchLocalUrl", get(fetch_by_query).post(fetch_by_body))
        .route("/searchPackage/:query", get(search_package))
        .route("/shutdown", post(shutdown))
}

/// 立即检测目标主机是否存活
///
/// GET /livenessCheck
/// 无需认证；检测失败也返回 200，结果在 `alive` 字段中
async fn liveness_check(State(state): State<Arc<AppState>>) -> Json<LivenessRecord> {
    Json(state.liveness.check().await)
}

/// GET /fetchLocalUrl?url=...
/// 需要 API Key 认证
async fn fetch_by_query(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Query(request): Query<FetchRequest>,
) -> ApiResult<Response> {
    proxy(&state, &request.url).await
}

/// POST /fetchLocalUrl {"url": "..."}
/// 需要 API Key 认证
async fn fetch_by_body(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<FetchRequest>,
) -> ApiResult<Response> {
    proxy(&state, &request.url).await
}

/// 搜索可安装的包
///
/// GET /searchPackage/:query
/// 需要 API Key 认证
async fn search_package(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(query): Path<String>,
) -> ApiResult<Json<SearchResult>> {
    Ok(Json(state.search.search(&query).await?))
}

/// 停止 agent
///
/// POST /shutdown
/// 需要 API Key 认证；有操作占用构建槽位时返回 409
async fn shutdown(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if let Some(running) = state.lifecycle.status().running {
        return Err(ApiError::conflict("an operation is in progress, refusing to shut down")
            .with_details(json!({ "running": running.operation })));
    }

    warn!("Shutdown requested over HTTP");
    trigger_shutdown();
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "shutting_down" }))))
}

/// 原样返回上游状态码、content-type 与响应体
async fn proxy(state: &AppState, url: &str) -> ApiResult<Response> {
    let resource = state.fetch.fetch(url).await?;

    let status = StatusCode::from_u16(resource.status).map_err(|_| {
        ApiError::bad_gateway(format!("upstream returned invalid status {}", resource.status))
    })?;

    let mut headers = HeaderMap::new();
    if let Some(content_type) = resource
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(header::CONTENT_TYPE, content_type);
    }

    Ok((status, headers, resource.body).into_response())
}
