//! 目标主机存活检测
//!
//! 检测结果只用于展示，从不影响部署状态

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LivenessConfig;
use crate::domain::liveness::{LivenessProbe, LivenessRecord};
use crate::infra::CommandRunner;

/// 存活检测器
pub struct LivenessMonitor {
    probe: LivenessProbe,
    timeout: Duration,
    interval: Duration,
    http: reqwest::Client,
    last: RwLock<Option<LivenessRecord>>,
}

impl LivenessMonitor {
    pub fn new(config: &LivenessConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            probe: config.probe.clone(),
            timeout,
            interval: Duration::from_secs(config.interval_secs),
            http,
            last: RwLock::new(None),
        }
    }

    /// 执行一次检测并覆盖上一次结果
    pub async fn check(&self) -> LivenessRecord {
        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.run_probe()).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        let (alive, diagnostic) = match result {
            Ok(Ok(detail)) => (true, detail),
            Ok(Err(reason)) => (false, Some(reason)),
            Err(_) => (false, Some(format!("probe timed out after {:?}", self.timeout))),
        };

        let record = LivenessRecord {
            alive,
            checked_at: Utc::now(),
            latency_ms,
            probe: self.probe.describe(),
            diagnostic,
        };

        if alive {
            debug!(probe = %record.probe, latency_ms, "Target host alive");
        } else {
            warn!(
                probe = %record.probe,
                diagnostic = record.diagnostic.as_deref().unwrap_or(""),
                "Target host liveness check failed"
            );
        }

        *self.last.write().await = Some(record.clone());
        record
    }

    /// 最近一次检测结果
    pub async fn last(&self) -> Option<LivenessRecord> {
        self.last.read().await.clone()
    }

    /// 启动后台周期检测（间隔为 0 时不启动）
    pub fn spawn_loop(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.interval.is_zero() {
            return None;
        }

        let monitor = self.clone();
        info!(interval_secs = monitor.interval.as_secs(), "Starting liveness loop");

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Liveness loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.check().await;
                    }
                }
            }
        }))
    }

    /// 成功时返回可选的附加信息，失败时返回原因
    async fn run_probe(&self) -> Result<Option<String>, String> {
        match &self.probe {
            LivenessProbe::Tcp(addr) => TcpStream::connect(addr.as_str())
                .await
                .map(|_| None)
                .map_err(|e| format!("connect {}: {}", addr, e)),

            LivenessProbe::Http(url) => {
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| format!("request failed: {}", e))?;
                let status = resp.status();
                if status.is_success() {
                    Ok(None)
                } else {
                    Err(format!("HTTP {}", status))
                }
            }

            LivenessProbe::Command { program, args } => {
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                let output = CommandRunner::run_simple(program, &args, Path::new("/"), self.timeout)
                    .await
                    .map_err(|e| e.to_string())?;
                let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let detail = (!text.is_empty()).then_some(text);
                if output.status.success() {
                    Ok(detail)
                } else {
                    Err(match (output.status.code(), detail) {
                        (Some(code), Some(d)) => format!("exit code {}: {}", code, d),
                        (Some(code), None) => format!("exit code {}", code),
                        (None, _) => "terminated by signal".to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn monitor(probe: LivenessProbe) -> LivenessMonitor {
        LivenessMonitor::new(&LivenessConfig {
            probe,
            interval_secs: 0,
            timeout_secs: 2,
        })
    }

    #[tokio::test]
    async fn test_tcp_probe_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let monitor = monitor(LivenessProbe::Tcp(addr.to_string()));
        assert!(monitor.last().await.is_none());

        let record = monitor.check().await;
        assert!(record.alive);
        assert!(record.diagnostic.is_none());
        assert!(monitor.last().await.unwrap().alive);
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port() {
        // 绑定后立即释放，端口上不再有监听者
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let record = monitor(LivenessProbe::Tcp(addr.to_string())).check().await;
        assert!(!record.alive);
        assert!(record.diagnostic.unwrap().contains("connect"));
    }

    #[tokio::test]
    async fn test_command_probe() {
        let ok = monitor(LivenessProbe::Command {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo running".to_string()],
        })
        .check()
        .await;
        assert!(ok.alive);
        assert_eq!(ok.diagnostic.as_deref(), Some("running"));

        let degraded = monitor(LivenessProbe::Command {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo degraded; exit 1".to_string()],
        })
        .check()
        .await;
        assert!(!degraded.alive);
        assert_eq!(degraded.diagnostic.as_deref(), Some("exit code 1: degraded"));
    }

    #[tokio::test]
    async fn test_loop_disabled_with_zero_interval() {
        let monitor = Arc::new(monitor(LivenessProbe::Tcp("127.0.0.1:1".to_string())));
        assert!(monitor.spawn_loop(CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let monitor = Arc::new(LivenessMonitor::new(&LivenessConfig {
            probe: LivenessProbe::Tcp(listener.local_addr().unwrap().to_string()),
            interval_secs: 1,
            timeout_secs: 1,
        }));

        let shutdown = CancellationToken::new();
        let handle = monitor.spawn_loop(shutdown.clone()).unwrap();

        // 第一次 tick 立即触发
        for _ in 0..50 {
            if monitor.last().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(monitor.last().await.unwrap().alive);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
