//! 存活检测领域模型

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 存活检测结果
///
/// 每次检测覆盖上一次结果，不持久化
#[derive(Clone, Debug, Serialize)]
pub struct LivenessRecord {
    pub alive: bool,
    pub checked_at: DateTime<Utc>,
    pub latency_ms: i64,
    /// 探测方式描述，如 `tcp 127.0.0.1:22`
    pub probe: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// 探测方式
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LivenessProbe {
    /// TCP 连接目标地址
    Tcp(String),
    /// HTTP GET，2xx 视为存活
    Http(String),
    /// 执行命令，退出码 0 视为存活
    Command { program: String, args: Vec<String> },
}

impl LivenessProbe {
    /// 解析 `tcp:host:port` / `http(s)://...` / `cmd:program args...`
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(addr) = s.strip_prefix("tcp:") {
            return (!addr.is_empty()).then(|| LivenessProbe::Tcp(addr.to_string()));
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Some(LivenessProbe::Http(s.to_string()));
        }
        if let Some(cmd) = s.strip_prefix("cmd:") {
            let mut parts = cmd.split_whitespace().map(str::to_string);
            let program = parts.next()?;
            return Some(LivenessProbe::Command {
                program,
                args: parts.collect(),
            });
        }
        None
    }

    pub fn describe(&self) -> String {
        match self {
            LivenessProbe::Tcp(addr) => format!("tcp {}", addr),
            LivenessProbe::Http(url) => format!("http {}", url),
            LivenessProbe::Command { program, args } => {
                format!("cmd {} {}", program, args.join(" ")).trim_end().to_string()
            }
        }
    }
}

impl Default for LivenessProbe {
    fn default() -> Self {
        LivenessProbe::Command {
            program: "systemctl".to_string(),
            args: vec!["is-system-running".to_string()],
        }
    }
}
