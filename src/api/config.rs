//! 配置文件 API
//!
//! 包含 /initConfiguration, /listNixFiles, /getNixFilesContents, /setNixFilesContents 端点。
//! 内容可以用 markdown 文档往返，便于外部助手整体改写后提交

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::domain::fileset::ConfigurationFileSet;
use crate::domain::lifecycle::DeploymentPhase;
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::state::AppState;

/// 初始化请求
#[derive(Debug, Default, Deserialize)]
struct InitRequest {
    /// 配置目录非空时是否覆盖
    #[serde(default)]
    overwrite: bool,
}

/// 初始化 / 写入配置响应
#[derive(Debug, Serialize)]
struct ConfigurationResponse {
    phase: DeploymentPhase,
    snapshot: String,
    files: Vec<String>,
}

/// 读取内容的输出格式
#[derive(Debug, Default, Deserialize)]
struct ContentsQuery {
    format: Option<String>,
}

/// 创建配置文件路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/initConfiguration", post(init_configuration))
        .route("/listNixFiles", get(list_files))
        .route("/getNixFilesContents", get(get_contents))
        .route("/setNixFilesContents", post(set_contents))
}

/// 重置配置目录为最小骨架
///
/// POST /initConfiguration
/// 需要 API Key 认证；body 可选 `{"overwrite": true}`
async fn init_configuration(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    body: Option<Json<InitRequest>>,
) -> ApiResult<Json<ConfigurationResponse>> {
    let overwrite = body.map(|Json(request)| request.overwrite).unwrap_or(false);
    let files = state.lifecycle.init(overwrite).await?;

    Ok(Json(ConfigurationResponse {
        phase: state.lifecycle.phase(),
        snapshot: files.snapshot_hash(),
        files: files.paths(),
    }))
}

/// 列出配置文件相对路径
///
/// GET /listNixFiles
/// 无需认证
async fn list_files(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<String>>> {
    let files = state.lifecycle.store().list_files().await?;
    Ok(Json(files))
}

/// 读取全部配置文件
///
/// GET /getNixFilesContents
/// 默认返回 markdown 文档，`?format=json` 返回 path -> content 映射
async fn get_contents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ContentsQuery>,
) -> ApiResult<Response> {
    let files = state.lifecycle.store().get_contents().await?;

    match query.format.as_deref() {
        Some("json") => Ok(Json(files).into_response()),
        None | Some("markdown") | Some("md") => Ok((
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            files.to_markdown(),
        )
            .into_response()),
        Some(other) => Err(ApiError::bad_request(format!(
            "unsupported format '{}', expected 'markdown' or 'json'",
            other
        ))),
    }
}

/// 整体替换配置文件集合
///
/// POST /setNixFilesContents
/// 需要 API Key 认证；body 为 path -> content 映射，或 `{"files": {...}}`。
/// `Content-Type: text/markdown` 时按 /getNixFilesContents 的 markdown 格式解析
async fn set_contents(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ConfigurationResponse>> {
    let files = parse_body(&headers, &body)?;
    let paths = files.paths();
    let snapshot = state.lifecycle.set_contents(files).await?;

    Ok(Json(ConfigurationResponse {
        phase: state.lifecycle.phase(),
        snapshot,
        files: paths,
    }))
}

fn parse_body(headers: &HeaderMap, body: &[u8]) -> ApiResult<ConfigurationFileSet> {
    let markdown = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/markdown"));

    if markdown {
        let doc = std::str::from_utf8(body)
            .map_err(|_| ApiError::bad_request("markdown body is not valid UTF-8"))?;
        return ConfigurationFileSet::from_markdown(doc)
            .map_err(|e| ApiError::bad_request(format!("invalid markdown file set: {}", e)));
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {}", e)))?;
    parse_file_set(value)
}

/// 兼容裸映射与 `{"files": ...}` 两种请求体
fn parse_file_set(body: Value) -> ApiResult<ConfigurationFileSet> {
    let body = match body {
        Value::Object(mut map) if map.len() == 1 && map.get("files").is_some_and(Value::is_object) => {
            map.remove("files").unwrap_or_default()
        }
        other => other,
    };

    serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("invalid file set: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_bare_map() {
        let files = parse_file_set(json!({
            "configuration.nix": "{ }",
            "modules/web.nix": "{ }"
        }))
        .unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files.get("modules/web.nix"), Some("{ }"));
    }

    #[test]
    fn test_parse_wrapped_map() {
        let files = parse_file_set(json!({
            "files": { "configuration.nix": "A" }
        }))
        .unwrap();
        assert_eq!(files.paths(), vec!["configuration.nix".to_string()]);
    }

    #[test]
    fn test_file_named_files_is_not_unwrapped() {
        let files = parse_file_set(json!({ "files": "plain content" })).unwrap();
        assert_eq!(files.get("files"), Some("plain content"));
    }

    #[test]
    fn test_parse_rejects_traversal() {
        let err = parse_file_set(json!({ "../etc/passwd": "x" })).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn test_parse_markdown_body() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "text/markdown; charset=utf-8".parse().unwrap());
        let doc = "### configuration.nix\n\n```nix\n{ }\n```\n\n### hosts/web.nix\n\n```nix\nW\n```\n";

        let files = parse_body(&headers, doc.as_bytes()).unwrap();
        assert_eq!(files.get("hosts/web.nix"), Some("W"));

        let err = parse_body(&headers, b"no blocks").unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        // 未声明 markdown 时按 JSON 解析
        assert!(parse_body(&HeaderMap::new(), doc.as_bytes()).is_err());
        assert!(parse_body(&HeaderMap::new(), br#"{"configuration.nix": "A"}"#).is_ok());
    }

    #[test]
    fn test_parse_rejects_non_string_content() {
        assert!(parse_file_set(json!({ "configuration.nix": 42 })).is_err());
        assert!(parse_file_set(json!(["configuration.nix"])).is_err());
    }
}
