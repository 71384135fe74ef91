//! 构建相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 构建模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// 只计算构建结果，不激活
    DryBuild,
    /// 构建并临时激活，不作为默认启动项
    Test,
    /// 构建并激活为默认配置
    Switch,
}

impl BuildMode {
    pub const ALL: [BuildMode; 3] = [BuildMode::DryBuild, BuildMode::Test, BuildMode::Switch];

    /// 传给构建工具的模式参数
    pub fn as_arg(&self) -> &'static str {
        match self {
            BuildMode::DryBuild => "dry-build",
            BuildMode::Test => "test",
            BuildMode::Switch => "switch",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::DryBuild => "dry_build",
            BuildMode::Test => "test",
            BuildMode::Switch => "switch",
        }
    }

    /// 解析 URL/配置中的模式名，兼容 `dry-build` 与 `dryBuild`
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "drybuild" | "dry" => Some(BuildMode::DryBuild),
            "test" => Some(BuildMode::Test),
            "switch" => Some(BuildMode::Switch),
            _ => None,
        }
    }
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// 构建结果
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Succeeded,
    /// 构建工具正常退出但退出码非 0
    Failed,
}

/// 一次构建尝试
///
/// 构建完成后不可变；控制器为每种模式保留最近一次
#[derive(Clone, Debug, Serialize)]
pub struct BuildAttempt {
    pub id: String,
    pub mode: BuildMode,
    /// 构建时文件集合的快照哈希
    pub snapshot: String,
    pub outcome: BuildOutcome,
    pub exit_code: i32,
    /// stdout + stderr 按到达顺序合并
    #[serde(serialize_with = "serialize_lossy")]
    pub output: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl BuildAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome == BuildOutcome::Succeeded
    }

    /// 输出文本（非 UTF-8 字节按 lossy 方式替换）
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// 构建尝试摘要（不含输出，用于状态查询）
#[derive(Clone, Debug, Serialize)]
pub struct AttemptSummary {
    pub id: String,
    pub mode: BuildMode,
    pub snapshot: String,
    pub outcome: BuildOutcome,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl From<&BuildAttempt> for AttemptSummary {
    fn from(attempt: &BuildAttempt) -> Self {
        Self {
            id: attempt.id.clone(),
            mode: attempt.mode,
            snapshot: attempt.snapshot.clone(),
            outcome: attempt.outcome,
            exit_code: attempt.exit_code,
            started_at: attempt.started_at,
            finished_at: attempt.finished_at,
            duration_ms: attempt.duration_ms,
        }
    }
}

#[allow(clippy::ptr_arg)]
fn serialize_lossy<S: serde::Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

/// 日志行
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr
    pub content: String,
}

impl LogLine {
    /// 创建新日志行
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new("stdout", content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new("stderr", content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_mode_args() {
        assert_eq!(BuildMode::DryBuild.as_arg(), "dry-build");
        assert_eq!(BuildMode::Test.as_arg(), "test");
        assert_eq!(BuildMode::Switch.as_arg(), "switch");
    }

    #[test]
    fn test_build_mode_parse() {
        assert_eq!(BuildMode::parse("dry-build"), Some(BuildMode::DryBuild));
        assert_eq!(BuildMode::parse("dryBuild"), Some(BuildMode::DryBuild));
        assert_eq!(BuildMode::parse("dry_build"), Some(BuildMode::DryBuild));
        assert_eq!(BuildMode::parse("SWITCH"), Some(BuildMode::Switch));
        assert_eq!(BuildMode::parse("boot"), None);
    }

    #[test]
    fn test_attempt_output_is_lossy_text() {
        let now = Utc::now();
        let attempt = BuildAttempt {
            id: "a".to_string(),
            mode: BuildMode::DryBuild,
            snapshot: "h".to_string(),
            outcome: BuildOutcome::Failed,
            exit_code: 1,
            output: vec![b'o', b'k', 0xff],
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        };

        assert!(!attempt.succeeded());
        assert_eq!(attempt.output_text(), "ok\u{fffd}");
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["output"], "ok\u{fffd}");
        assert_eq!(json["mode"], "dry_build");
    }

    #[test]
    fn test_log_line_creation() {
        let line = LogLine::stdout("Hello");
        assert_eq!(line.stream, "stdout");
        assert_eq!(line.content, "Hello");

        let line = LogLine::stderr("Error");
        assert_eq!(line.stream, "stderr");
    }
}
