//! 构建 API
//!
//! 包含 /runDryBuild, /runTest, /runSwitch, /cancelBuild, /logs/:attempt_id/stream 端点

use axum::{
    extract::{Path, State},
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::domain::build::BuildMode;
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::services::lifecycle::RunningOperation;
use crate::state::AppState;

/// 取消构建响应
#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
    operation: RunningOperation,
}

/// 创建构建路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/runDryBuild", post(run_dry_build))
        .route("/runTest", post(run_test))
        .route("/runSwitch", post(run_switch))
        .route("/cancelBuild", post(cancel_build))
        .route("/logs/:attempt_id/stream", get(stream_logs))
}

/// POST /runDryBuild
/// 需要 API Key 认证
async fn run_dry_build(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    run_build(&state, BuildMode::DryBuild).await
}

/// POST /runTest
/// 需要 API Key 认证
async fn run_test(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    run_build(&state, BuildMode::Test).await
}

/// POST /runSwitch
/// 需要 API Key 认证
async fn run_switch(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    run_build(&state, BuildMode::Switch).await
}

/// 执行构建并等待完成
///
/// 成功时返回构建输出文本，构建工具非 0 退出时返回 502 并在 details 中附带输出。
/// 请求断开时构建被取消
async fn run_build(state: &Arc<AppState>, mode: BuildMode) -> ApiResult<Response> {
    info!(mode = %mode, "Build requested");
    let attempt = state.lifecycle.run_build(mode).await?;

    if !attempt.succeeded() {
        return Err(ApiError::build_failed(&attempt));
    }

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        [("x-attempt-id", attempt.id.clone())],
        attempt.output_text(),
    )
        .into_response())
}

/// 取消正在运行的构建
///
/// POST /cancelBuild
/// 需要 API Key 认证
async fn cancel_build(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<CancelResponse>> {
    let operation = state
        .lifecycle
        .cancel_build()
        .ok_or_else(|| ApiError::conflict("no build is running"))?;

    Ok(Json(CancelResponse {
        cancelled: true,
        operation,
    }))
}

/// 流式构建日志
///
/// GET /logs/:attempt_id/stream
/// 无需认证；构建已结束时只发送 `complete` 事件
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if !state.log_hub.exists(&attempt_id).await {
        return Err(ApiError::not_found(format!("Attempt '{}'", attempt_id)));
    }

    // 已结束的通道返回 None
    let rx = state.log_hub.subscribe(&attempt_id).await;
    let log_hub = state.log_hub.clone();

    let stream = async_stream::stream! {
        if let Some(mut rx) = rx {
            loop {
                match rx.recv().await {
                    Ok(log_line) => {
                        let json = serde_json::to_string(&log_line).unwrap_or_default();
                        yield Ok(Event::default().data(json));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(attempt_id = %attempt_id, lagged = n, "Log subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        // 发送结束事件
        if let Some(completion) = log_hub.completion(&attempt_id).await {
            yield Ok(Event::default()
                .event("complete")
                .data(serde_json::to_string(&completion).unwrap_or_default()));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}
