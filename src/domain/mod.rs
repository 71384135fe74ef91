//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod build;
pub mod fileset;
pub mod lifecycle;
pub mod liveness;
pub mod shell;

// Re-exports for convenience
pub use build::{AttemptSummary, BuildAttempt, BuildMode, BuildOutcome, LogLine};
pub use fileset::{ConfigurationFileSet, PathError};
pub use lifecycle::{DeploymentPhase, Operation, SwitchPolicy};
pub use liveness::{LivenessProbe, LivenessRecord};
pub use shell::{ShellConfig, ShellRequest, ShellSessionInfo, ShellStatus, WindowSize};
