//! 命令执行器
//!
//! 提供统一的命令执行接口，支持：
//! - stdout/stderr 按到达顺序合并捕获（字节透明）
//! - 实时分块广播到日志通道
//! - 超时控制与取消支持

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::domain::build::LogLine;

/// 读取缓冲区大小
const READ_CHUNK_SIZE: usize = 8192;

/// 子进程结束后等待输出读取完成的宽限时间
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug)]
pub enum CommandError {
    /// 命令启动失败
    SpawnFailed(std::io::Error),
    /// 命令超时（进程已被终止）
    Timeout { after: Duration, output: Vec<u8> },
    /// 命令被取消（进程已被终止）
    Cancelled { output: Vec<u8> },
    /// 等待命令完成失败
    WaitFailed(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::SpawnFailed(e) => write!(f, "Failed to spawn command: {}", e),
            CommandError::Timeout { after, .. } => write!(f, "Command timed out after {:?}", after),
            CommandError::Cancelled { .. } => write!(f, "Command was cancelled"),
            CommandError::WaitFailed(e) => write!(f, "Failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::SpawnFailed(e) | CommandError::WaitFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// 命令执行结果
pub struct CommandOutput {
    /// 退出状态
    pub status: ExitStatus,
    /// stdout + stderr 合并输出
    pub combined: Vec<u8>,
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

impl CommandRunner {
    /// 执行命令，合并捕获输出并流式广播
    ///
    /// # Arguments
    /// * `program` - 要执行的程序
    /// * `args` - 命令行参数
    /// * `work_dir` - 工作目录
    /// * `log_tx` - 日志发送通道
    /// * `cancel` - 取消令牌
    /// * `timeout` - 超时时间
    pub async fn run_captured(
        program: &str,
        args: &[String],
        work_dir: &Path,
        log_tx: broadcast::Sender<LogLine>,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CommandError::SpawnFailed)?;

        let combined: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
        let readers = [
            child
                .stdout
                .take()
                .map(|out| spawn_reader(out, "stdout", combined.clone(), log_tx.clone())),
            child
                .stderr
                .take()
                .map(|err| spawn_reader(err, "stderr", combined.clone(), log_tx.clone())),
        ];

        // 等待命令完成，支持超时和取消
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program, "Command cancelled, killing process");
                let _ = child.kill().await;
                Err(Interrupted::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                error!(program, "Command timed out after {:?}", timeout);
                let _ = child.kill().await;
                Err(Interrupted::TimedOut)
            }
            status = child.wait() => Ok(status),
        };

        // 等待日志读取完成；子进程派生的后台进程可能一直持有管道
        for reader in readers.into_iter().flatten() {
            drain(reader).await;
        }
        let output = take_buffer(&combined);

        match result {
            Ok(status) => {
                let status = status.map_err(CommandError::WaitFailed)?;
                Ok(CommandOutput {
                    status,
                    combined: output,
                })
            }
            Err(Interrupted::Cancelled) => Err(CommandError::Cancelled { output }),
            Err(Interrupted::TimedOut) => Err(CommandError::Timeout {
                after: timeout,
                output,
            }),
        }
    }

    /// 执行简单命令（无流式输出）
    ///
    /// 用于不需要实时日志的场景（如 git commit）
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        let child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .kill_on_drop(true)
            .output();

        tokio::select! {
            result = child => {
                result.map_err(CommandError::SpawnFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout { after: timeout, output: Vec::new() })
            }
        }
    }
}

enum Interrupted {
    Cancelled,
    TimedOut,
}

fn spawn_reader<R>(
    mut reader: R,
    stream: &'static str,
    combined: SharedBuffer,
    log_tx: broadcast::Sender<LogLine>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    combined
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .extend_from_slice(chunk);
                    let _ = log_tx.send(LogLine::new(stream, String::from_utf8_lossy(chunk)));
                }
            }
        }
    })
}

async fn drain(mut reader: JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_GRACE, &mut reader).await.is_err() {
        warn!("Output pipe still open after process exit, detaching reader");
        reader.abort();
    }
}

fn take_buffer(buf: &SharedBuffer) -> Vec<u8> {
    std::mem::take(&mut *buf.lock().unwrap_or_else(|e| e.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_run_simple_success() {
        let result = CommandRunner::run_simple(
            "echo",
            &["hello"],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[tokio::test]
    async fn test_run_simple_not_found() {
        let result = CommandRunner::run_simple(
            "nonexistent_command_12345",
            &[],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_run_captured_combines_streams() {
        let (tx, mut rx) = broadcast::channel(16);
        let output = CommandRunner::run_captured(
            "sh",
            &sh("echo out; echo err >&2; exit 3"),
            &PathBuf::from("/tmp"),
            tx,
            CancellationToken::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(output.status.code(), Some(3));
        let text = String::from_utf8_lossy(&output.combined);
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_run_captured_cancel() {
        let (tx, _rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = CommandRunner::run_captured(
            "sh",
            &sh("echo started; sleep 30"),
            &PathBuf::from("/tmp"),
            tx,
            cancel,
            Duration::from_secs(60),
        )
        .await;

        match result {
            Err(CommandError::Cancelled { output }) => {
                assert!(String::from_utf8_lossy(&output).contains("started"));
            }
            _ => panic!("expected cancellation"),
        }
    }

    #[tokio::test]
    async fn test_run_captured_timeout() {
        let (tx, _rx) = broadcast::channel(16);
        let result = CommandRunner::run_captured(
            "sh",
            &sh("sleep 30"),
            &PathBuf::from("/tmp"),
            tx,
            CancellationToken::new(),
            Duration::from_millis(200),
        )
        .await;

        assert!(matches!(result, Err(CommandError::Timeout { .. })));
    }
}
