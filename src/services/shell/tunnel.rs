//! Shell 会话注册与转发
//!
//! 每个 WebSocket 连接对应一个远端 shell。二进制帧原样作为输入，
//! 文本帧除尺寸控制消息外也原样作为输入；输出以二进制帧发送。

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ShellBackend, ShellChannel, ShellOutput};
use crate::domain::lifecycle::DeploymentPhase;
use crate::domain::shell::{ShellConfig, ShellRequest, ShellSessionInfo, ShellStatus, WindowSize};

/// 正常关闭（shell 退出）
const CLOSE_NORMAL: u16 = 1000;
/// 服务关闭或空闲超时
const CLOSE_GOING_AWAY: u16 = 1001;
/// 远端通道出错
pub const CLOSE_INTERNAL: u16 = 1011;
/// switch 开始，会话被终止
pub const CLOSE_SWITCHING: u16 = 4001;

/// Shell 通道错误
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("a switch is being applied, shell sessions are suspended")]
    Switching,

    #[error("too many shell sessions ({0} active)")]
    TooManySessions(usize),

    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("authentication failed for user '{0}'")]
    AuthFailed(String),

    #[error("timed out connecting to {0}")]
    Timeout(String),
}

/// 会话结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    ClientClosed,
    ShellExited,
    Switching,
    Idle,
    Terminated,
    ChannelError,
}

impl SessionEnd {
    /// 需要发给客户端的关闭帧；客户端主动关闭时不需要
    fn close_frame(&self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            SessionEnd::ClientClosed => return None,
            SessionEnd::ShellExited => (CLOSE_NORMAL, "shell exited"),
            SessionEnd::Switching => (CLOSE_SWITCHING, "switch in progress"),
            SessionEnd::Idle => (CLOSE_GOING_AWAY, "idle timeout"),
            SessionEnd::Terminated => (CLOSE_GOING_AWAY, "session terminated"),
            SessionEnd::ChannelError => (CLOSE_INTERNAL, "remote shell error"),
        };
        Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })
    }
}

struct SessionEntry {
    info: ShellSessionInfo,
    cancel: CancellationToken,
}

/// 已打开、等待转发的会话
pub struct ShellSession {
    id: String,
    cancel: CancellationToken,
    channel: Box<dyn ShellChannel>,
}

impl ShellSession {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Shell 通道
pub struct ShellTunnel {
    config: ShellConfig,
    backend: Arc<dyn ShellBackend>,
    phase_rx: watch::Receiver<DeploymentPhase>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl ShellTunnel {
    pub fn new(
        config: ShellConfig,
        backend: Arc<dyn ShellBackend>,
        phase_rx: watch::Receiver<DeploymentPhase>,
    ) -> Self {
        Self {
            config,
            backend,
            phase_rx,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// 检查当前是否接受新会话（升级 WebSocket 前调用）
    pub async fn admit(&self) -> Result<(), TunnelError> {
        self.check_capacity(self.sessions.read().await.len())
    }

    fn check_capacity(&self, active: usize) -> Result<(), TunnelError> {
        if !self.config.allow_during_switch && *self.phase_rx.borrow() == DeploymentPhase::Switching {
            return Err(TunnelError::Switching);
        }
        if active >= self.config.max_sessions {
            return Err(TunnelError::TooManySessions(active));
        }
        Ok(())
    }

    /// 打开远端 shell 并登记会话
    ///
    /// 连接远端之前先在同一把写锁下检查并占位，连接失败时移除
    pub async fn open(&self, request: ShellRequest) -> Result<ShellSession, TunnelError> {
        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        {
            let mut sessions = self.sessions.write().await;
            self.check_capacity(sessions.len())?;
            let now = Utc::now();
            sessions.insert(
                id.clone(),
                SessionEntry {
                    info: ShellSessionInfo {
                        session_id: id.clone(),
                        username: request
                            .username
                            .clone()
                            .unwrap_or_else(|| self.config.username.clone()),
                        target_addr: self.backend.target(),
                        client_addr: request.client_addr.clone(),
                        opened_at: now,
                        last_activity: now,
                    },
                    cancel: cancel.clone(),
                },
            );
        }

        let channel = match self.backend.open(&request).await {
            Ok(channel) => channel,
            Err(e) => {
                self.sessions.write().await.remove(&id);
                return Err(e);
            }
        };
        info!(session_id = %id, client_addr = %request.client_addr, "Shell session opened");

        Ok(ShellSession {
            id,
            cancel,
            channel,
        })
    }

    /// 双向转发直到任一端关闭
    ///
    /// 结束时两端都会被关闭，会话从注册表移除
    pub async fn relay<S, K, E>(&self, session: ShellSession, mut ws_rx: S, mut ws_tx: K)
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        K: Sink<Message> + Unpin,
        E: Display,
    {
        let ShellSession {
            id,
            cancel,
            mut channel,
        } = session;
        let mut phase_rx = self.phase_rx.clone();
        let mut phase_open = true;
        let idle_timeout = (self.config.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.idle_timeout_secs));
        let mut last_activity = Instant::now();

        let watch_switch = !self.config.allow_during_switch;
        let end = if watch_switch && *phase_rx.borrow_and_update() == DeploymentPhase::Switching {
            SessionEnd::Switching
        } else {
            loop {
                let idle = async move {
                    match idle_timeout {
                        Some(t) => tokio::time::sleep_until(last_activity + t).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = cancel.cancelled() => break SessionEnd::Terminated,

                    changed = phase_rx.changed(), if watch_switch && phase_open => {
                        match changed {
                            Ok(()) => {
                                if *phase_rx.borrow_and_update() == DeploymentPhase::Switching {
                                    break SessionEnd::Switching;
                                }
                            }
                            Err(_) => phase_open = false,
                        }
                    }

                    msg = ws_rx.next() => {
                        let input = match msg {
                            Some(Ok(Message::Binary(data))) => data,
                            Some(Ok(Message::Text(text))) => {
                                if let Some(size) = WindowSize::parse_control(&text) {
                                    debug!(session_id = %id, cols = size.cols, rows = size.rows, "Resize");
                                    if let Err(e) = channel.resize(size).await {
                                        warn!(session_id = %id, error = %e, "Failed to resize remote pty");
                                    }
                                    continue;
                                }
                                text.into_bytes()
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = ws_tx.send(Message::Pong(data)).await;
                                continue;
                            }
                            Some(Ok(Message::Pong(_))) => continue,
                            Some(Ok(Message::Close(_))) | None => break SessionEnd::ClientClosed,
                            Some(Err(e)) => {
                                warn!(session_id = %id, error = %e, "WebSocket error");
                                break SessionEnd::ClientClosed;
                            }
                        };

                        last_activity = Instant::now();
                        self.touch(&id).await;
                        if let Err(e) = channel.write(&input).await {
                            warn!(session_id = %id, error = %e, "Failed to write to remote shell");
                            break SessionEnd::ChannelError;
                        }
                    }

                    out = channel.read() => {
                        match out {
                            Some(ShellOutput::Data(data)) => {
                                last_activity = Instant::now();
                                if ws_tx.send(Message::Binary(data)).await.is_err() {
                                    break SessionEnd::ClientClosed;
                                }
                            }
                            Some(ShellOutput::Exit(code)) => {
                                debug!(session_id = %id, exit_code = code, "Remote shell exited");
                                break SessionEnd::ShellExited;
                            }
                            None => break SessionEnd::ShellExited,
                        }
                    }

                    _ = idle => break SessionEnd::Idle,
                }
            }
        };

        channel.close().await;
        if let Some(frame) = end.close_frame() {
            let _ = ws_tx.send(Message::Close(Some(frame))).await;
        }
        let _ = ws_tx.close().await;

        self.sessions.write().await.remove(&id);
        info!(session_id = %id, reason = ?end, "Shell session closed");
    }

    /// 终止所有会话
    pub async fn terminate_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        for entry in sessions.values() {
            entry.cancel.cancel();
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Terminating shell sessions");
        }
        sessions.len()
    }

    pub async fn status(&self) -> ShellStatus {
        let sessions = self.sessions.read().await;
        ShellStatus {
            target_addr: self.backend.target(),
            allow_during_switch: self.config.allow_during_switch,
            active_sessions: sessions.len(),
            max_sessions: self.config.max_sessions,
            sessions: sessions.values().map(|e| e.info.clone()).collect(),
        }
    }

    async fn touch(&self, id: &str) {
        if let Some(entry) = self.sessions.write().await.get_mut(id) {
            entry.info.last_activity = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc as tokio_mpsc;

    /// 回显输入的假 shell，输入 `exit` 时退出
    struct EchoBackend {
        closed: Arc<AtomicBool>,
        resizes: Arc<Mutex<Vec<WindowSize>>>,
    }

    struct EchoChannel {
        tx: tokio_mpsc::UnboundedSender<ShellOutput>,
        rx: tokio_mpsc::UnboundedReceiver<ShellOutput>,
        closed: Arc<AtomicBool>,
        resizes: Arc<Mutex<Vec<WindowSize>>>,
    }

    #[async_trait]
    impl ShellBackend for EchoBackend {
        async fn open(&self, _request: &ShellRequest) -> Result<Box<dyn ShellChannel>, TunnelError> {
            let (tx, rx) = tokio_mpsc::unbounded_channel();
            Ok(Box::new(EchoChannel {
                tx,
                rx,
                closed: self.closed.clone(),
                resizes: self.resizes.clone(),
            }))
        }

        fn target(&self) -> String {
            "echo".to_string()
        }
    }

    #[async_trait]
    impl ShellChannel for EchoChannel {
        async fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
            if data == b"exit\n" {
                self.tx.send(ShellOutput::Exit(0))?;
            } else {
                self.tx.send(ShellOutput::Data(data.to_vec()))?;
            }
            Ok(())
        }

        async fn resize(&mut self, size: WindowSize) -> anyhow::Result<()> {
            self.resizes.lock().unwrap().push(size);
            Ok(())
        }

        async fn read(&mut self) -> Option<ShellOutput> {
            self.rx.recv().await
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// 连接耗时较长，可配置为连接失败
    struct SlowBackend {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl ShellBackend for SlowBackend {
        async fn open(&self, _request: &ShellRequest) -> Result<Box<dyn ShellChannel>, TunnelError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(TunnelError::AuthFailed("root".to_string()));
            }
            let (tx, rx) = tokio_mpsc::unbounded_channel();
            Ok(Box::new(EchoChannel {
                tx,
                rx,
                closed: Arc::new(AtomicBool::new(false)),
                resizes: Arc::new(Mutex::new(Vec::new())),
            }))
        }

        fn target(&self) -> String {
            "slow".to_string()
        }
    }

    fn slow_tunnel(max_sessions: usize, fail: bool) -> Arc<ShellTunnel> {
        let backend = Arc::new(SlowBackend {
            delay: Duration::from_millis(100),
            fail,
        });
        let (_phase_tx, phase_rx) = watch::channel(DeploymentPhase::Ready);
        let config = ShellConfig {
            max_sessions,
            ..ShellConfig::default()
        };
        Arc::new(ShellTunnel::new(config, backend, phase_rx))
    }

    struct Harness {
        tunnel: Arc<ShellTunnel>,
        phase_tx: watch::Sender<DeploymentPhase>,
        closed: Arc<AtomicBool>,
        resizes: Arc<Mutex<Vec<WindowSize>>>,
    }

    fn harness(config: ShellConfig) -> Harness {
        let closed = Arc::new(AtomicBool::new(false));
        let resizes = Arc::new(Mutex::new(Vec::new()));
        let backend = Arc::new(EchoBackend {
            closed: closed.clone(),
            resizes: resizes.clone(),
        });
        let (phase_tx, phase_rx) = watch::channel(DeploymentPhase::Ready);
        Harness {
            tunnel: Arc::new(ShellTunnel::new(config, backend, phase_rx)),
            phase_tx,
            closed,
            resizes,
        }
    }

    type ClientTx = mpsc::UnboundedSender<Result<Message, axum::Error>>;
    type ClientRx = mpsc::UnboundedReceiver<Message>;

    /// 打开会话并在后台转发，返回客户端两端
    async fn connect(h: &Harness) -> (ClientTx, ClientRx, tokio::task::JoinHandle<()>) {
        let session = h.tunnel.open(ShellRequest::default()).await.unwrap();
        let (client_tx, ws_rx) = mpsc::unbounded();
        let (ws_tx, client_rx) = mpsc::unbounded();
        let tunnel = h.tunnel.clone();
        let handle = tokio::spawn(async move { tunnel.relay(session, ws_rx, ws_tx).await });
        (client_tx, client_rx, handle)
    }

    async fn next(rx: &mut ClientRx) -> Message {
        tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .expect("no message from relay")
            .expect("relay closed")
    }

    fn close_code(msg: Message) -> u16 {
        match msg {
            Message::Close(Some(frame)) => frame.code,
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relay_echo_and_resize() {
        let h = harness(ShellConfig::default());
        let (client_tx, mut client_rx, handle) = connect(&h).await;
        assert_eq!(h.tunnel.status().await.active_sessions, 1);

        client_tx
            .unbounded_send(Ok(Message::Binary(b"ls\n".to_vec())))
            .unwrap();
        assert_eq!(next(&mut client_rx).await, Message::Binary(b"ls\n".to_vec()));

        client_tx
            .unbounded_send(Ok(Message::Text(r#"{"cols": 120, "rows": 40}"#.to_string())))
            .unwrap();
        client_tx
            .unbounded_send(Ok(Message::Text("pwd\n".to_string())))
            .unwrap();
        assert_eq!(next(&mut client_rx).await, Message::Binary(b"pwd\n".to_vec()));
        assert_eq!(
            h.resizes.lock().unwrap().as_slice(),
            &[WindowSize { cols: 120, rows: 40 }]
        );

        // 客户端断开，远端通道随之关闭
        drop(client_tx);
        handle.await.unwrap();
        assert!(h.closed.load(Ordering::SeqCst));
        assert_eq!(h.tunnel.status().await.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_shell_exit_closes_websocket() {
        let h = harness(ShellConfig::default());
        let (client_tx, mut client_rx, handle) = connect(&h).await;

        client_tx
            .unbounded_send(Ok(Message::Binary(b"exit\n".to_vec())))
            .unwrap();
        assert_eq!(close_code(next(&mut client_rx).await), CLOSE_NORMAL);
        handle.await.unwrap();
        assert!(h.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_open_rejected_during_switch() {
        let h = harness(ShellConfig::default());
        h.phase_tx.send_replace(DeploymentPhase::Switching);

        assert!(matches!(h.tunnel.admit().await, Err(TunnelError::Switching)));
        assert!(matches!(
            h.tunnel.open(ShellRequest::default()).await,
            Err(TunnelError::Switching)
        ));

        let permissive = harness(ShellConfig {
            allow_during_switch: true,
            ..ShellConfig::default()
        });
        permissive.phase_tx.send_replace(DeploymentPhase::Switching);
        assert!(permissive.tunnel.open(ShellRequest::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_switch_terminates_open_sessions() {
        let h = harness(ShellConfig::default());
        let (_client_tx, mut client_rx, handle) = connect(&h).await;

        h.phase_tx.send_replace(DeploymentPhase::Validating);
        h.phase_tx.send_replace(DeploymentPhase::Switching);

        assert_eq!(close_code(next(&mut client_rx).await), CLOSE_SWITCHING);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(h.closed.load(Ordering::SeqCst));
        assert_eq!(h.tunnel.status().await.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_max_sessions() {
        let h = harness(ShellConfig {
            max_sessions: 1,
            ..ShellConfig::default()
        });
        let _first = h.tunnel.open(ShellRequest::default()).await.unwrap();

        assert!(matches!(
            h.tunnel.open(ShellRequest::default()).await,
            Err(TunnelError::TooManySessions(1))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_opens_respect_max_sessions() {
        let tunnel = slow_tunnel(1, false);

        let (a, b) = tokio::join!(
            tunnel.open(ShellRequest::default()),
            tunnel.open(ShellRequest::default())
        );
        let opened = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(opened, 1);
        assert!(matches!(
            a.err().or(b.err()),
            Some(TunnelError::TooManySessions(1))
        ));
        assert_eq!(tunnel.status().await.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_failed_connect_releases_slot() {
        let tunnel = slow_tunnel(1, true);

        assert!(matches!(
            tunnel.open(ShellRequest::default()).await,
            Err(TunnelError::AuthFailed(_))
        ));
        assert_eq!(tunnel.status().await.active_sessions, 0);
        assert!(tunnel.admit().await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_session_is_closed() {
        let h = harness(ShellConfig {
            idle_timeout_secs: 1,
            ..ShellConfig::default()
        });
        let (_client_tx, mut client_rx, handle) = connect(&h).await;

        assert_eq!(close_code(next(&mut client_rx).await), CLOSE_GOING_AWAY);
        handle.await.unwrap();
        assert!(h.closed.load(Ordering::SeqCst));
        assert_eq!(h.tunnel.status().await.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_terminate_all() {
        let h = harness(ShellConfig::default());
        let (_client_tx, mut client_rx, handle) = connect(&h).await;

        assert_eq!(h.tunnel.terminate_all().await, 1);
        assert_eq!(close_code(next(&mut client_rx).await), CLOSE_GOING_AWAY);
        handle.await.unwrap();
    }
}
