//! 远程 shell API
//!
//! 包含 /ssh WebSocket 端点

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::shell::{ShellRequest, WindowSize};
use crate::error::ApiResult;
use crate::middleware::RequireApiKey;
use crate::services::shell::{TunnelError, CLOSE_INTERNAL, CLOSE_SWITCHING};
use crate::state::AppState;

/// 关闭帧原因的最大字节数
const MAX_CLOSE_REASON: usize = 123;

/// 初始窗口大小
#[derive(Debug, Default, Deserialize)]
struct ShellQuery {
    cols: Option<u32>,
    rows: Option<u32>,
}

/// 创建 shell 路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ssh", get(open_shell))
}

/// 打开交互式 shell
///
/// GET /ssh (WebSocket)
/// 需要 API Key 认证；`ssh-user` / `ssh-secret` header 覆盖默认登录凭据。
/// switch 进行中返回 409
async fn open_shell(
    ws: WebSocketUpgrade,
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ShellQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    state.shell.admit().await?;

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let defaults = WindowSize::default();
    let request = ShellRequest {
        username: header("ssh-user"),
        password: header("ssh-secret"),
        window: WindowSize {
            cols: query.cols.unwrap_or(defaults.cols),
            rows: query.rows.unwrap_or(defaults.rows),
        },
        // 获取客户端地址
        client_addr: header("x-forwarded-for").unwrap_or_else(|| "unknown".to_string()),
    };

    Ok(ws.on_upgrade(move |socket| handle_shell_connection(socket, state, request)))
}

/// 处理升级后的连接
async fn handle_shell_connection(mut socket: WebSocket, state: Arc<AppState>, request: ShellRequest) {
    let session = match state.shell.open(request).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Failed to open shell session");
            let code = match e {
                TunnelError::Switching => CLOSE_SWITCHING,
                _ => CLOSE_INTERNAL,
            };
            let mut reason = e.to_string();
            truncate_reason(&mut reason);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    debug!(session_id = %session.id(), "Relaying shell session");
    let (ws_tx, ws_rx) = socket.split();
    state.shell.relay(session, ws_rx, ws_tx).await;
}

fn truncate_reason(reason: &mut String) {
    if reason.len() <= MAX_CLOSE_REASON {
        return;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason.truncate(end);
}
