//! 日志通道管理
//!
//! 管理构建日志的广播通道，支持 SSE 订阅和自动清理

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::domain::build::LogLine;

/// 日志通道容量
const LOG_CHANNEL_CAPACITY: usize = 256;

/// 构建结束摘要（SSE `complete` 事件）
#[derive(Clone, Debug, Serialize)]
pub struct LogCompletion {
    /// succeeded | failed | cancelled | timed_out | error
    pub outcome: String,
    pub exit_code: Option<i32>,
}

/// 日志通道信息
struct LogChannel {
    /// 广播发送者；完成后丢弃，订阅者随之收到 Closed
    sender: Option<broadcast::Sender<LogLine>>,
    /// 创建时间
    created_at: DateTime<Utc>,
    completion: Option<LogCompletion>,
}

/// 日志中心
///
/// 每次构建尝试一个通道，以 attempt id 为键
pub struct LogHub {
    /// 通道映射 (attempt_id -> LogChannel)
    channels: RwLock<HashMap<String, LogChannel>>,
}

impl LogHub {
    /// 创建新的日志中心
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// 创建新的日志通道
    ///
    /// 如果通道已存在且未完成，返回现有的发送者
    pub async fn create(&self, attempt_id: &str) -> broadcast::Sender<LogLine> {
        let mut channels = self.channels.write().await;

        if let Some(sender) = channels.get(attempt_id).and_then(|c| c.sender.clone()) {
            return sender;
        }

        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        channels.insert(
            attempt_id.to_string(),
            LogChannel {
                sender: Some(sender.clone()),
                created_at: Utc::now(),
                completion: None,
            },
        );

        sender
    }

    /// 订阅日志通道
    ///
    /// 通道不存在或已完成时返回 None
    pub async fn subscribe(&self, attempt_id: &str) -> Option<broadcast::Receiver<LogLine>> {
        let channels = self.channels.read().await;
        channels
            .get(attempt_id)
            .and_then(|c| c.sender.as_ref())
            .map(|s| s.subscribe())
    }

    /// 标记通道完成
    ///
    /// 丢弃中心持有的发送者，SSE 客户端在运行方也释放后收到完成事件
    pub async fn finish(&self, attempt_id: &str, completion: LogCompletion) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(attempt_id) {
            channel.sender = None;
            channel.completion = Some(completion);
        }
    }

    /// 获取完成摘要
    pub async fn completion(&self, attempt_id: &str) -> Option<LogCompletion> {
        let channels = self.channels.read().await;
        channels.get(attempt_id).and_then(|c| c.completion.clone())
    }

    /// 检查通道是否存在
    pub async fn exists(&self, attempt_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.contains_key(attempt_id)
    }

    /// 清理过期通道
    ///
    /// 移除创建时间超过指定时长的已完成通道
    pub async fn cleanup_expired(&self, max_age_hours: i64) {
        let now = Utc::now();
        let mut channels = self.channels.write().await;

        channels.retain(|_, channel| {
            let age = now - channel.created_at;
            age.num_hours() < max_age_hours || channel.completion.is_none()
        });
    }

    /// 获取活跃通道数量（未完成）
    pub async fn active_count(&self) -> usize {
        let channels = self.channels.read().await;
        channels.values().filter(|c| c.completion.is_none()).count()
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}
