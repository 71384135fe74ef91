//! 部署生命周期状态机
//!
//! 纯数据与转换规则；锁、构建槽位和副作用在 services/lifecycle.rs

use serde::{Deserialize, Serialize};

use super::build::BuildMode;

/// 部署阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Uninitialized,
    Ready,
    Validating,
    Validated,
    Testing,
    Tested,
    Switching,
    Applied,
    Failed,
    /// 文件集合原子性被破坏，必须重新 init
    Corrupt,
}

impl DeploymentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentPhase::Uninitialized => "uninitialized",
            DeploymentPhase::Ready => "ready",
            DeploymentPhase::Validating => "validating",
            DeploymentPhase::Validated => "validated",
            DeploymentPhase::Testing => "testing",
            DeploymentPhase::Tested => "tested",
            DeploymentPhase::Switching => "switching",
            DeploymentPhase::Applied => "applied",
            DeploymentPhase::Failed => "failed",
            DeploymentPhase::Corrupt => "corrupt",
        }
    }

    /// 构建进行中的阶段
    pub fn active_for(mode: BuildMode) -> Self {
        match mode {
            BuildMode::DryBuild => DeploymentPhase::Validating,
            BuildMode::Test => DeploymentPhase::Testing,
            BuildMode::Switch => DeploymentPhase::Switching,
        }
    }

    /// 构建成功后的阶段
    pub fn completed_for(mode: BuildMode) -> Self {
        match mode {
            BuildMode::DryBuild => DeploymentPhase::Validated,
            BuildMode::Test => DeploymentPhase::Tested,
            BuildMode::Switch => DeploymentPhase::Applied,
        }
    }

    /// 当前阶段是否允许启动该模式的构建
    pub fn can_start(&self, mode: BuildMode, policy: SwitchPolicy) -> bool {
        use DeploymentPhase::*;
        match mode {
            BuildMode::DryBuild | BuildMode::Test => {
                matches!(self, Ready | Validated | Tested | Failed)
            }
            BuildMode::Switch => match policy {
                SwitchPolicy::RequireValidation => matches!(self, Validated | Tested),
                SwitchPolicy::Permissive => matches!(self, Ready | Validated | Tested | Failed),
            },
        }
    }
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// switch 前置条件策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchPolicy {
    /// 当前快照必须先通过 dry-build 或 test
    #[default]
    RequireValidation,
    /// 允许未验证直接 switch（由构建工具自行校验）
    Permissive,
}

impl SwitchPolicy {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "permissive" | "allow" | "unvalidated" => SwitchPolicy::Permissive,
            _ => SwitchPolicy::RequireValidation,
        }
    }
}

/// 占用构建槽位的操作
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "mode")]
pub enum Operation {
    Init,
    SetContents,
    Build(BuildMode),
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Init => f.write_str("init"),
            Operation::SetContents => f.write_str("set-contents"),
            Operation::Build(mode) => write!(f, "{}", mode),
        }
    }
}
