//! 统一错误处理
//!
//! 提供 `ApiError` 枚举实现 `IntoResponse`，并把各服务层错误映射为 HTTP 状态码

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::domain::build::BuildAttempt;
use crate::services::{
    ConcurrencyError, FetchError, LifecycleError, RunnerError, SearchError, StoreError,
    TunnelError,
};

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 403 - 禁止访问（如：代理非本机地址）
    Forbidden(String),
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 409 - 冲突（如：构建已在进行、switch 进行中）
    Conflict(String),
    /// 500 - 内部错误
    Internal(String),
    /// 502 - 上游（构建工具 / 目标服务）失败
    BadGateway(String),
    /// 503 - 服务不可用（如：配置目录损坏）
    ServiceUnavailable(String),
    /// 504 - 上游超时
    GatewayTimeout(String),
    /// 502 - 构建工具以非 0 退出码结束
    BuildFailed {
        attempt_id: String,
        mode: &'static str,
        exit_code: i32,
        output: String,
    },
    /// 附带 details 的错误
    Detailed(Box<ApiError>, Value),
}

impl ApiError {
    /// 创建未授权错误
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    /// 创建禁止访问错误
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// 创建未找到错误
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// 创建请求无效错误
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// 创建冲突错误
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// 创建内部错误
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// 创建上游失败错误
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::BadGateway(message.into())
    }

    /// 创建服务不可用错误
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    /// 创建上游超时错误
    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::GatewayTimeout(message.into())
    }

    /// 构建失败
    pub fn build_failed(attempt: &BuildAttempt) -> Self {
        Self::BuildFailed {
            attempt_id: attempt.id.clone(),
            mode: attempt.mode.as_str(),
            exit_code: attempt.exit_code,
            output: attempt.output_text(),
        }
    }

    /// 附加 details
    pub fn with_details(self, details: impl Into<Value>) -> Self {
        Self::Detailed(Box::new(self), details.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadGateway(_) | ApiError::BuildFailed { .. } => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Detailed(inner, _) => inner.status(),
        }
    }

    fn into_body(self) -> ErrorResponse {
        match self {
            ApiError::Unauthorized => {
                ErrorResponse::new("unauthorized", "Invalid or missing API key")
            }
            ApiError::Forbidden(msg) => ErrorResponse::new("forbidden", msg),
            ApiError::NotFound(resource) => {
                ErrorResponse::new("not_found", format!("{} not found", resource))
            }
            ApiError::BadRequest(msg) => ErrorResponse::new("bad_request", msg),
            ApiError::Conflict(msg) => ErrorResponse::new("conflict", msg),
            ApiError::Internal(msg) => ErrorResponse::new("internal_error", msg),
            ApiError::BadGateway(msg) => ErrorResponse::new("bad_gateway", msg),
            ApiError::ServiceUnavailable(msg) => ErrorResponse::new("service_unavailable", msg),
            ApiError::GatewayTimeout(msg) => ErrorResponse::new("gateway_timeout", msg),
            ApiError::BuildFailed {
                attempt_id,
                mode,
                exit_code,
                output,
            } => ErrorResponse::new(
                "build_failed",
                format!("{} exited with code {}", mode, exit_code),
            )
            .with_details(json!({
                "attempt_id": attempt_id,
                "exit_code": exit_code,
                "output": output,
            })),
            ApiError::Detailed(inner, details) => inner.into_body().with_details(details),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "Request failed");
        }
        (status, Json(self.into_body())).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::Forbidden(m) => write!(f, "Forbidden: {}", m),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
            ApiError::BadGateway(m) => write!(f, "Bad gateway: {}", m),
            ApiError::ServiceUnavailable(m) => write!(f, "Service unavailable: {}", m),
            ApiError::GatewayTimeout(m) => write!(f, "Gateway timeout: {}", m),
            ApiError::BuildFailed {
                mode, exit_code, ..
            } => write!(f, "Build failed: {} exited with code {}", mode, exit_code),
            ApiError::Detailed(inner, _) => inner.fmt(f),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let message = e.to_string();
        match e {
            StoreError::InvalidPath(_) => ApiError::bad_request(message),
            StoreError::NotEmpty { count } => {
                ApiError::conflict(message).with_details(json!({ "existing_files": count }))
            }
            StoreError::Corrupt | StoreError::PartialWrite(_) => {
                ApiError::service_unavailable(message)
            }
            StoreError::NotWritable { .. } | StoreError::Io { .. } => ApiError::internal(message),
        }
    }
}

impl From<ConcurrencyError> for ApiError {
    fn from(e: ConcurrencyError) -> Self {
        let message = e.to_string();
        match e {
            ConcurrencyError::Busy { running } => {
                ApiError::conflict(message).with_details(json!({ "running": running }))
            }
            ConcurrencyError::InvalidTransition { from, operation } => ApiError::conflict(message)
                .with_details(json!({ "phase": from, "operation": operation })),
            ConcurrencyError::Switching | ConcurrencyError::NotValidated => {
                ApiError::conflict(message)
            }
        }
    }
}

impl From<RunnerError> for ApiError {
    fn from(e: RunnerError) -> Self {
        let output = String::from_utf8_lossy(e.output()).into_owned();
        let err = ApiError::internal(e.to_string());
        if output.is_empty() {
            err
        } else {
            err.with_details(json!({ "output": output }))
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::Store(e) => e.into(),
            LifecycleError::Runner(e) => e.into(),
            LifecycleError::Concurrency(e) => e.into(),
            LifecycleError::Aborted(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(e: FetchError) -> Self {
        let message = e.to_string();
        match e {
            FetchError::InvalidUrl { .. } => ApiError::bad_request(message),
            FetchError::Forbidden(_) => ApiError::forbidden(message),
            FetchError::Unreachable(_) | FetchError::BadResponse(_) => {
                ApiError::bad_gateway(message)
            }
            FetchError::Timeout(_) => ApiError::gateway_timeout(message),
        }
    }
}

impl From<TunnelError> for ApiError {
    fn from(e: TunnelError) -> Self {
        let message = e.to_string();
        match e {
            TunnelError::Switching => ApiError::conflict(message),
            TunnelError::TooManySessions(_) => ApiError::service_unavailable(message),
            TunnelError::AuthFailed(_) => ApiError::forbidden(message),
            TunnelError::Connect { .. } => ApiError::bad_gateway(message),
            TunnelError::Timeout(_) => ApiError::gateway_timeout(message),
        }
    }
}

impl From<SearchError> for ApiError {
    fn from(e: SearchError) -> Self {
        let message = e.to_string();
        match e {
            SearchError::InvalidQuery(_) => ApiError::bad_request(message),
            SearchError::Unavailable { .. } => ApiError::service_unavailable(message),
            SearchError::Timeout(_) => ApiError::gateway_timeout(message),
            SearchError::Failed { exit_code, stderr } => ApiError::bad_gateway(message)
                .with_details(json!({ "exit_code": exit_code, "stderr": stderr })),
        }
    }
}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fileset::PathError;
    use crate::domain::lifecycle::{DeploymentPhase, Operation};
    use std::time::Duration;

    #[test]
    fn test_error_response_new() {
        let resp = ErrorResponse::new("test_error", "Test message");
        assert_eq!(resp.error, "test_error");
        assert_eq!(resp.message, "Test message");
        assert!(resp.details.is_none());
    }

    #[test]
    fn test_error_response_with_details() {
        let resp = ErrorResponse::new("test_error", "Test message").with_details("Extra info");
        assert_eq!(resp.details, Some(Value::from("Extra info")));
    }

    #[test]
    fn test_store_error_status() {
        let invalid: ApiError = StoreError::InvalidPath(PathError::Empty).into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let not_empty: ApiError = StoreError::NotEmpty { count: 3 }.into();
        assert_eq!(not_empty.status(), StatusCode::CONFLICT);

        let corrupt: ApiError = StoreError::Corrupt.into();
        assert_eq!(corrupt.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_concurrency_error_is_conflict() {
        let busy: ApiError = LifecycleError::Concurrency(ConcurrencyError::Busy {
            running: Operation::Build(crate::domain::build::BuildMode::Test),
        })
        .into();
        assert_eq!(busy.status(), StatusCode::CONFLICT);

        let transition: ApiError = ConcurrencyError::InvalidTransition {
            from: DeploymentPhase::Uninitialized,
            operation: Operation::SetContents,
        }
        .into();
        assert_eq!(transition.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_fetch_error_status() {
        let cases: Vec<(FetchError, StatusCode)> = vec![
            (
                FetchError::InvalidUrl {
                    url: "x".into(),
                    reason: "bad".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (FetchError::Forbidden("example.com".into()), StatusCode::FORBIDDEN),
            (FetchError::Unreachable("refused".into()), StatusCode::BAD_GATEWAY),
            (
                FetchError::Timeout(Duration::from_secs(1)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_runner_error_carries_partial_output() {
        let err: ApiError = RunnerError::TimedOut {
            secs: 5,
            output: b"building...\n".to_vec(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = err.into_body();
        assert_eq!(body.error, "internal_error");
        assert_eq!(body.details.unwrap()["output"], "building...\n");
    }

    #[test]
    fn test_detailed_keeps_inner_status() {
        let err = ApiError::conflict("busy").with_details(json!({ "k": 1 }));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "Conflict: busy");
    }
}
