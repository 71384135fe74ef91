//! 远程 shell 通道相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::env;

/// 终端窗口大小
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// 终端尺寸控制消息
///
/// 兼容旧客户端的 `{"high": rows, "width": cols}`
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ResizeMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(alias = "width")]
    cols: u32,
    #[serde(alias = "high", alias = "height")]
    rows: u32,
}

impl WindowSize {
    /// 尝试把文本帧解析为尺寸控制消息，否则视为普通输入
    pub fn parse_control(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let msg: ResizeMessage = serde_json::from_str(trimmed).ok()?;
        if msg.kind.as_deref().is_some_and(|k| k != "resize") {
            return None;
        }
        let valid = (1..=1000).contains(&msg.cols) && (1..=1000).contains(&msg.rows);
        valid.then_some(WindowSize {
            cols: msg.cols,
            rows: msg.rows,
        })
    }
}

/// Shell 通道配置
#[derive(Clone, Debug)]
pub struct ShellConfig {
    /// 目标主机 sshd 地址
    pub ssh_addr: String,
    /// 默认登录用户
    pub username: String,
    /// 密码认证
    pub password: Option<String>,
    /// 私钥文件（优先于密码）
    pub key_file: Option<String>,
    /// 目标主机密钥的 SHA256 指纹；未配置时只信任回环地址
    pub known_host_fingerprint: Option<String>,
    /// switch 期间是否仍允许 shell 会话
    pub allow_during_switch: bool,
    /// 最大并发会话数 (默认 10)
    pub max_sessions: usize,
    /// 空闲超时秒数 (默认 300，0 表示不限)
    pub idle_timeout_secs: u64,
    /// SSH 连接超时秒数 (默认 10)
    pub connect_timeout_secs: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            ssh_addr: "127.0.0.1:22".to_string(),
            username: "root".to_string(),
            password: None,
            key_file: None,
            known_host_fingerprint: None,
            allow_during_switch: false,
            max_sessions: 10,
            idle_timeout_secs: 300,
            connect_timeout_secs: 10,
        }
    }
}

impl ShellConfig {
    /// 从环境变量加载 shell 配置
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ssh_addr = env::var("SHELL_SSH_ADDR").unwrap_or(defaults.ssh_addr);
        let username = env::var("SHELL_SSH_USER").unwrap_or(defaults.username);
        let password = env::var("SHELL_SSH_PASSWORD").ok().filter(|s| !s.is_empty());
        let key_file = env::var("SHELL_SSH_KEY_FILE").ok().filter(|s| !s.is_empty());
        let known_host_fingerprint = env::var("SHELL_SSH_KNOWN_HOST_FINGERPRINT")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let allow_during_switch = env::var("SHELL_ALLOW_DURING_SWITCH")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let max_sessions = env::var("SHELL_MAX_SESSIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_sessions);

        let idle_timeout_secs = env::var("SHELL_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.idle_timeout_secs);

        let connect_timeout_secs = env::var("SHELL_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.connect_timeout_secs);

        Self {
            ssh_addr,
            username,
            password,
            key_file,
            known_host_fingerprint,
            allow_during_switch,
            max_sessions,
            idle_timeout_secs,
            connect_timeout_secs,
        }
    }
}

/// 建立会话的请求参数
#[derive(Clone, Debug, Default)]
pub struct ShellRequest {
    /// 覆盖默认用户
    pub username: Option<String>,
    /// 覆盖默认密码
    pub password: Option<String>,
    pub window: WindowSize,
    pub client_addr: String,
}

/// Shell 会话信息
#[derive(Clone, Debug, Serialize)]
pub struct ShellSessionInfo {
    pub session_id: String,
    pub username: String,
    pub target_addr: String,
    pub client_addr: String,
    pub opened_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Shell 通道状态 (用于 /status 响应)
#[derive(Clone, Debug, Serialize)]
pub struct ShellStatus {
    pub target_addr: String,
    pub allow_during_switch: bool,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub sessions: Vec<ShellSessionInfo>,
}
