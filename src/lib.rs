//! Nix Deploy Agent - NixOS 配置部署代理
//!
//! 管理目标主机的 NixOS 配置目录，驱动 dry-build / test / switch 生命周期，
//! 并提供远程 shell 通道

pub mod error;
pub mod middleware;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::env::{constants::VERSION, EnvConfig};
use crate::state::{get_shutdown_token, trigger_shutdown, AppState};

/// 已完成的日志通道保留时长（小时）
const LOG_RETENTION_HOURS: i64 = 24;

/// 命令行覆盖的运行时配置
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
    /// 覆盖监听端口
    pub port_override: Option<u16>,
    /// 覆盖配置根目录
    pub config_dir_override: Option<PathBuf>,
}

/// 初始化日志并运行代理，直到收到 Ctrl-C 或全局 shutdown
pub async fn init_and_run_agent_with_config(runtime: RuntimeConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run_agent(runtime).await {
        error!(error = %format!("{:#}", e), "Agent exited with error");
        std::process::exit(1);
    }
}

async fn run_agent(runtime: RuntimeConfig) -> anyhow::Result<()> {
    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        config.port = port;
    }
    if let Some(dir) = runtime.config_dir_override {
        config.store.root = dir;
    }

    info!(version = VERSION, "Starting nix-deploy-agent");

    let port = config.port;
    let state = Arc::new(AppState::new(config).await);
    let shutdown = get_shutdown_token();

    let liveness_task = state.liveness.spawn_loop(shutdown.clone());
    spawn_log_cleanup(state.clone());

    let app = api::router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .context("server error")?;

    if let Some(task) = liveness_task {
        let _ = task.await;
    }
    info!("Agent stopped");
    Ok(())
}

/// 等待 Ctrl-C 或全局 shutdown，然后关闭所有 shell 会话
async fn shutdown_signal(state: Arc<AppState>) {
    let shutdown = get_shutdown_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                // 无法监听信号时只响应全局 shutdown
                shutdown.cancelled().await;
            }
        }
        _ = shutdown.cancelled() => {}
    }

    info!("Shutdown requested");
    trigger_shutdown();

    if let Some(running) = state.lifecycle.status().running {
        warn!(
            operation = %running.operation,
            "Shutting down while an operation holds the build slot"
        );
    }
    state.shell.terminate_all().await;
}

/// 定期清理已完成的构建日志通道
fn spawn_log_cleanup(state: Arc<AppState>) {
    let shutdown = get_shutdown_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => state.log_hub.cleanup_expired(LOG_RETENTION_HOURS).await,
            }
        }
    });
}
