//! SSH 客户端后端
//!
//! 用 russh 连接目标主机的 sshd 并打开交互式 PTY shell

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tracing::{debug, info, warn};

use super::{ShellBackend, ShellChannel, ShellOutput, TunnelError};
use crate::domain::shell::{ShellConfig, ShellRequest, WindowSize};

/// russh 客户端回调
struct ClientHandler {
    target: String,
    known_fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        let accepted = host_key_accepted(&self.target, self.known_fingerprint.as_deref(), &fingerprint);
        if accepted {
            debug!(target_addr = %self.target, fingerprint = %fingerprint, "Host key accepted");
        } else {
            warn!(
                target_addr = %self.target,
                fingerprint = %fingerprint,
                "Rejecting host key, set SHELL_SSH_KNOWN_HOST_FINGERPRINT for non-loopback targets"
            );
        }
        Ok(accepted)
    }
}

/// 主机密钥校验
///
/// 配置了指纹时必须一致；未配置时只接受回环地址上的 sshd
fn host_key_accepted(ssh_addr: &str, expected: Option<&str>, fingerprint: &str) -> bool {
    let normalize = |s: &str| s.trim().trim_start_matches("SHA256:").trim_end_matches('=').to_string();
    match expected {
        Some(expected) => normalize(expected) == normalize(fingerprint),
        None => is_loopback_addr(ssh_addr),
    }
}

fn is_loopback_addr(addr: &str) -> bool {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.ip().is_loopback();
    }
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// 通过 SSH 连接目标 sshd 的 shell 后端
pub struct SshBackend {
    config: ShellConfig,
    client_config: Arc<client::Config>,
}

impl SshBackend {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            config,
            client_config: Arc::new(client::Config::default()),
        }
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
        request: &ShellRequest,
        username: &str,
    ) -> Result<bool, TunnelError> {
        let connect_err = |e: russh::Error| TunnelError::Connect {
            addr: self.config.ssh_addr.clone(),
            reason: e.to_string(),
        };

        // header 中的凭据优先于配置
        if let Some(password) = &request.password {
            return handle
                .authenticate_password(username, password)
                .await
                .map_err(connect_err);
        }

        if let Some(key_file) = &self.config.key_file {
            let key = russh_keys::load_secret_key(key_file, None).map_err(|e| {
                TunnelError::Connect {
                    addr: self.config.ssh_addr.clone(),
                    reason: format!("failed to load key {}: {}", key_file, e),
                }
            })?;
            return handle
                .authenticate_publickey(username, Arc::new(key))
                .await
                .map_err(connect_err);
        }

        if let Some(password) = &self.config.password {
            return handle
                .authenticate_password(username, password)
                .await
                .map_err(connect_err);
        }

        warn!("No SSH credentials configured for shell sessions");
        Ok(false)
    }
}

#[async_trait]
impl ShellBackend for SshBackend {
    async fn open(&self, request: &ShellRequest) -> Result<Box<dyn ShellChannel>, TunnelError> {
        let addr = self.config.ssh_addr.clone();
        let username = request
            .username
            .clone()
            .unwrap_or_else(|| self.config.username.clone());

        let connect = client::connect(
            self.client_config.clone(),
            addr.as_str(),
            ClientHandler {
                target: addr.clone(),
                known_fingerprint: self.config.known_host_fingerprint.clone(),
            },
        );
        let mut handle = tokio::time::timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            connect,
        )
        .await
        .map_err(|_| TunnelError::Timeout(addr.clone()))?
        .map_err(|e| TunnelError::Connect {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        if !self.authenticate(&mut handle, request, &username).await? {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(TunnelError::AuthFailed(username));
        }

        let channel_err = |e: russh::Error| TunnelError::Connect {
            addr: addr.clone(),
            reason: e.to_string(),
        };
        let mut channel = handle.channel_open_session().await.map_err(channel_err)?;
        channel
            .request_pty(
                false,
                "xterm",
                request.window.cols,
                request.window.rows,
                0,
                0,
                &[],
            )
            .await
            .map_err(channel_err)?;
        channel.request_shell(true).await.map_err(channel_err)?;

        info!(
            target_addr = %addr,
            username = %username,
            cols = request.window.cols,
            rows = request.window.rows,
            "Remote shell opened"
        );

        Ok(Box::new(SshChannel { handle, channel }))
    }

    fn target(&self) -> String {
        self.config.ssh_addr.clone()
    }
}

/// 已打开的 SSH 会话通道
struct SshChannel {
    handle: Handle<ClientHandler>,
    channel: Channel<client::Msg>,
}

#[async_trait]
impl ShellChannel for SshChannel {
    async fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.channel.data(data).await?;
        Ok(())
    }

    async fn resize(&mut self, size: WindowSize) -> anyhow::Result<()> {
        self.channel.window_change(size.cols, size.rows, 0, 0).await?;
        Ok(())
    }

    async fn read(&mut self) -> Option<ShellOutput> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(ShellOutput::Data(data.to_vec())),
                ChannelMsg::ExtendedData { data, .. } => {
                    return Some(ShellOutput::Data(data.to_vec()))
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ShellOutput::Exit(exit_status))
                }
                ChannelMsg::Eof | ChannelMsg::Close => return None,
                _ => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_targets_need_no_fingerprint() {
        assert!(host_key_accepted("127.0.0.1:22", None, "abc"));
        assert!(host_key_accepted("[::1]:22", None, "abc"));
        assert!(host_key_accepted("localhost:2222", None, "abc"));
        assert!(!host_key_accepted("10.0.0.5:22", None, "abc"));
        assert!(!host_key_accepted("build-host.lan:22", None, "abc"));
    }

    #[test]
    fn test_configured_fingerprint_must_match() {
        let fp = "nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8";
        assert!(host_key_accepted("10.0.0.5:22", Some(fp), fp));
        assert!(host_key_accepted("10.0.0.5:22", Some(&format!("SHA256:{}", fp)), fp));
        assert!(!host_key_accepted("10.0.0.5:22", Some(fp), "other"));
        // 配置了指纹时回环地址也要校验
        assert!(!host_key_accepted("127.0.0.1:22", Some(fp), "other"));
    }
}
