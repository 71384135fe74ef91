//! 构建执行器
//!
//! 以 dry-build / test / switch 模式调用外部构建工具，合并捕获输出。
//! 构建工具非 0 退出是正常的失败结果，不是错误。

use chrono::Utc;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BuildConfig;
use crate::domain::build::{BuildAttempt, BuildMode, BuildOutcome};
use crate::infra::{CommandError, CommandRunner};
use crate::state::log_hub::{LogCompletion, LogHub};

/// 构建执行错误
///
/// `Spawn` 表示构建工具根本没有运行；其余表示运行过但没有正常结束
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start build program '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for build program: {0}")]
    Wait(#[source] io::Error),

    #[error("build program was terminated by a signal")]
    Terminated { output: Vec<u8> },

    #[error("build was cancelled")]
    Cancelled { output: Vec<u8> },

    #[error("build timed out after {secs}s")]
    TimedOut { secs: u64, output: Vec<u8> },
}

impl RunnerError {
    /// 出错前已捕获的输出
    pub fn output(&self) -> &[u8] {
        match self {
            RunnerError::Terminated { output }
            | RunnerError::Cancelled { output }
            | RunnerError::TimedOut { output, .. } => output,
            _ => &[],
        }
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            RunnerError::Cancelled { .. } => "cancelled",
            RunnerError::TimedOut { .. } => "timed_out",
            _ => "error",
        }
    }
}

/// 构建执行器
pub struct BuildRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    root: PathBuf,
    log_hub: Arc<LogHub>,
}

impl BuildRunner {
    pub fn new(config: &BuildConfig, root: PathBuf, log_hub: Arc<LogHub>) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            root,
            log_hub,
        }
    }

    pub fn log_hub(&self) -> &Arc<LogHub> {
        &self.log_hub
    }

    /// 替换参数模板中的占位符
    pub fn render_args(&self, mode: BuildMode) -> Vec<String> {
        let root = self.root.display().to_string();
        self.args
            .iter()
            .map(|a| a.replace("{mode}", mode.as_arg()).replace("{config_root}", &root))
            .collect()
    }

    /// 执行一次构建
    ///
    /// 输出实时写入 `attempt_id` 对应的日志通道
    pub async fn run(
        &self,
        attempt_id: &str,
        mode: BuildMode,
        snapshot: &str,
        cancel: CancellationToken,
    ) -> Result<BuildAttempt, RunnerError> {
        let started_at = Utc::now();
        let log_tx = self.log_hub.create(attempt_id).await;
        let args = self.render_args(mode);

        info!(
            attempt_id,
            mode = %mode,
            program = %self.program,
            args = ?args,
            "Starting build"
        );

        let result = CommandRunner::run_captured(
            &self.program,
            &args,
            &self.root,
            log_tx,
            cancel,
            self.timeout,
        )
        .await;
        let finished_at = Utc::now();

        let result = match result {
            Ok(output) => match output.status.code() {
                Some(exit_code) => Ok(BuildAttempt {
                    id: attempt_id.to_string(),
                    mode,
                    snapshot: snapshot.to_string(),
                    outcome: if exit_code == 0 {
                        BuildOutcome::Succeeded
                    } else {
                        BuildOutcome::Failed
                    },
                    exit_code,
                    output: output.combined,
                    started_at,
                    finished_at,
                    duration_ms: (finished_at - started_at).num_milliseconds(),
                }),
                None => Err(RunnerError::Terminated {
                    output: output.combined,
                }),
            },
            Err(CommandError::SpawnFailed(source)) => Err(RunnerError::Spawn {
                program: self.program.clone(),
                source,
            }),
            Err(CommandError::WaitFailed(e)) => Err(RunnerError::Wait(e)),
            Err(CommandError::Cancelled { output }) => Err(RunnerError::Cancelled { output }),
            Err(CommandError::Timeout { output, .. }) => Err(RunnerError::TimedOut {
                secs: self.timeout.as_secs(),
                output,
            }),
        };

        let completion = match &result {
            Ok(attempt) => {
                info!(
                    attempt_id,
                    mode = %mode,
                    exit_code = attempt.exit_code,
                    duration_ms = attempt.duration_ms,
                    "Build finished"
                );
                LogCompletion {
                    outcome: if attempt.succeeded() { "succeeded" } else { "failed" }.to_string(),
                    exit_code: Some(attempt.exit_code),
                }
            }
            Err(e) => {
                warn!(attempt_id, mode = %mode, error = %e, "Build did not complete");
                LogCompletion {
                    outcome: e.outcome_label().to_string(),
                    exit_code: None,
                }
            }
        };
        self.log_hub.finish(attempt_id, completion).await;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// 用 `sh -c` 脚本代替构建工具，`$0` 为模式，`$1` 为配置根目录
    fn script_config(script: &str, timeout_secs: u64) -> BuildConfig {
        BuildConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                script.to_string(),
                "{mode}".to_string(),
                "{config_root}".to_string(),
            ],
            timeout_secs,
            ..BuildConfig::default()
        }
    }

    fn runner(dir: &TempDir, config: &BuildConfig) -> BuildRunner {
        BuildRunner::new(config, dir.path().to_path_buf(), Arc::new(LogHub::new()))
    }

    #[test]
    fn test_render_default_args() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, &BuildConfig::default());
        let args = runner.render_args(BuildMode::DryBuild);

        assert_eq!(args[0], "dry-build");
        assert_eq!(
            args[2],
            format!("nixos-config={}/configuration.nix", dir.path().display())
        );
    }

    #[tokio::test]
    async fn test_successful_build() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, &script_config("echo mode=$0; pwd", 10));

        let attempt = runner
            .run("a1", BuildMode::Test, "hash", CancellationToken::new())
            .await
            .unwrap();

        assert!(attempt.succeeded());
        assert_eq!(attempt.exit_code, 0);
        assert_eq!(attempt.snapshot, "hash");
        let text = attempt.output_text();
        assert!(text.contains("mode=test"));
        let root = dir.path().canonicalize().unwrap();
        assert!(text.contains(&*root.to_string_lossy()));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failed_attempt() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, &script_config("echo 'error: undefined variable' >&2; exit 1", 10));

        let attempt = runner
            .run("a1", BuildMode::DryBuild, "hash", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempt.outcome, BuildOutcome::Failed);
        assert_eq!(attempt.exit_code, 1);
        assert!(attempt.output_text().contains("undefined variable"));

        let completion = runner.log_hub().completion("a1").await.unwrap();
        assert_eq!(completion.outcome, "failed");
        assert_eq!(completion.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_missing_program_never_ran() {
        let dir = TempDir::new().unwrap();
        let config = BuildConfig {
            program: "nonexistent-nixos-rebuild-12345".to_string(),
            ..BuildConfig::default()
        };
        let runner = runner(&dir, &config);

        let err = runner
            .run("a1", BuildMode::Switch, "hash", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
        assert_eq!(runner.log_hub().completion("a1").await.unwrap().outcome, "error");
    }

    #[tokio::test]
    async fn test_timeout_kills_build() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, &script_config("echo begin; sleep 30", 1));

        let err = runner
            .run("a1", BuildMode::DryBuild, "hash", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::TimedOut { secs: 1, .. }));
        assert!(String::from_utf8_lossy(err.output()).contains("begin"));
    }
}
