//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::env::EnvConfig;
use crate::services::{
    shell::{ShellBackend, SshBackend},
    BuildRunner, FileStore, LifecycleController, LivenessMonitor, PackageSearch, RemoteFetchProxy,
    ShellTunnel,
};

use super::log_hub::LogHub;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN
        .get_or_init(CancellationToken::new)
        .clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// API 密钥（未配置时控制接口不校验）
    pub api_key: Option<String>,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 配置与构建 ==========
    /// 构建日志中心
    pub log_hub: Arc<LogHub>,
    /// 部署生命周期控制器（持有 FileStore 与 BuildRunner）
    pub lifecycle: Arc<LifecycleController>,

    // ========== 目标主机 ==========
    /// 存活检测
    pub liveness: Arc<LivenessMonitor>,
    /// 本地 URL 代理
    pub fetch: RemoteFetchProxy,
    /// 远程 shell 通道
    pub shell: Arc<ShellTunnel>,
    /// 包搜索
    pub search: PackageSearch,
}

impl AppState {
    /// 创建新的应用状态，shell 会话通过 SSH 连接目标主机
    pub async fn new(config: EnvConfig) -> Self {
        let backend = Arc::new(SshBackend::new(config.shell.clone()));
        Self::with_shell_backend(config, backend).await
    }

    /// 使用指定的 shell 后端创建应用状态
    pub async fn with_shell_backend(config: EnvConfig, backend: Arc<dyn ShellBackend>) -> Self {
        tracing::info!(
            auth = config.api_key.is_some(),
            port = config.port,
            config_root = %config.store.root.display(),
            git_versioning = config.store.git_versioning,
            build_program = %config.build.program,
            switch_policy = ?config.build.switch_policy,
            liveness_probe = %config.liveness.probe.describe(),
            shell_target = %config.shell.ssh_addr,
            "Loaded configuration"
        );

        let log_hub = Arc::new(LogHub::new());
        let store = Arc::new(FileStore::new(&config.store));
        let runner = BuildRunner::new(&config.build, config.store.root.clone(), log_hub.clone());
        let lifecycle =
            LifecycleController::open(store, runner, config.build.switch_policy).await;

        let shell = Arc::new(ShellTunnel::new(
            config.shell.clone(),
            backend,
            lifecycle.subscribe_phase(),
        ));

        Self {
            api_key: config.api_key.clone(),
            started_at: Utc::now(),

            log_hub,
            lifecycle,

            liveness: Arc::new(LivenessMonitor::new(&config.liveness)),
            fetch: RemoteFetchProxy::new(&config.fetch),
            shell,
            search: PackageSearch::new(&config.search),

            config,
        }
    }
}
