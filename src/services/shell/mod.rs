//! 远程 shell 通道
//!
//! WebSocket 与目标主机 sshd 之间的双向转发，switch 期间暂停

mod ssh;
mod tunnel;

pub use ssh::SshBackend;
pub use tunnel::{ShellSession, ShellTunnel, TunnelError, CLOSE_INTERNAL, CLOSE_SWITCHING};

use async_trait::async_trait;

use crate::domain::shell::{ShellRequest, WindowSize};

/// shell 输出
#[derive(Debug, PartialEq, Eq)]
pub enum ShellOutput {
    Data(Vec<u8>),
    /// 远端 shell 退出
    Exit(u32),
}

/// 打开远端 shell 的方式
#[async_trait]
pub trait ShellBackend: Send + Sync {
    /// 连接目标主机并启动交互式 shell
    async fn open(&self, request: &ShellRequest) -> Result<Box<dyn ShellChannel>, TunnelError>;

    /// 目标地址（用于展示）
    fn target(&self) -> String;
}

/// 已打开的 shell 通道
#[async_trait]
pub trait ShellChannel: Send {
    async fn write(&mut self, data: &[u8]) -> anyhow::Result<()>;

    async fn resize(&mut self, size: WindowSize) -> anyhow::Result<()>;

    /// 读取下一段输出，通道关闭时返回 None
    async fn read(&mut self) -> Option<ShellOutput>;

    async fn close(&mut self);
}
