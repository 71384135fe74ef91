//! 部署生命周期控制器
//!
//! 串行化配置修改与构建：同一时刻只有一个操作持有构建槽位，
//! 并发请求立即失败而不是排队。槽位是 RAII 许可，任何没有正常结束的构建
//! （出错、取消、超时、调用方断开）在许可释放时把阶段置为 `failed`。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::build::{AttemptSummary, BuildAttempt, BuildMode};
use crate::domain::fileset::ConfigurationFileSet;
use crate::domain::lifecycle::{DeploymentPhase, Operation, SwitchPolicy};

use super::builder::{BuildRunner, RunnerError};
use super::store::{FileStore, StoreError};

/// 并发与状态转换错误
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    #[error("another operation is in progress: {running}")]
    Busy { running: Operation },

    #[error("a switch is being applied, try again after it finishes")]
    Switching,

    #[error("cannot run {operation} while phase is {from}")]
    InvalidTransition {
        from: DeploymentPhase,
        operation: Operation,
    },

    #[error("current configuration has not passed dry-build or test, refusing to switch")]
    NotValidated,
}

/// 控制器错误
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error("operation aborted unexpectedly: {0}")]
    Aborted(String),
}

/// 正在持有槽位的操作
#[derive(Clone, Debug, Serialize)]
pub struct RunningOperation {
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    cancel: CancellationToken,
}

/// 部署状态快照
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentStatus {
    pub phase: DeploymentPhase,
    pub switch_policy: SwitchPolicy,
    /// 当前磁盘上文件集合的快照哈希
    pub committed_snapshot: Option<String>,
    /// 最近一次通过 dry-build/test 的快照哈希
    pub validated_snapshot: Option<String>,
    pub running: Option<RunningOperation>,
    pub last_attempts: BTreeMap<&'static str, AttemptSummary>,
    pub last_error: Option<String>,
}

struct ControllerState {
    phase: DeploymentPhase,
    committed: Option<String>,
    validated: Option<String>,
    running: Option<RunningOperation>,
    last_attempts: HashMap<BuildMode, BuildAttempt>,
    last_error: Option<String>,
}

/// 部署生命周期控制器
pub struct LifecycleController {
    store: Arc<FileStore>,
    runner: BuildRunner,
    policy: SwitchPolicy,
    state: Mutex<ControllerState>,
    phase_tx: watch::Sender<DeploymentPhase>,
}

impl LifecycleController {
    /// 创建控制器
    ///
    /// 配置根目录已有入口文件时从 `ready` 开始，否则 `uninitialized`
    pub async fn open(store: Arc<FileStore>, runner: BuildRunner, policy: SwitchPolicy) -> Arc<Self> {
        let (phase, committed) = if store.has_entry_point() {
            match store.get_contents().await {
                Ok(files) => (DeploymentPhase::Ready, Some(files.snapshot_hash())),
                Err(e) => {
                    warn!(error = %e, "Failed to read existing configuration");
                    (DeploymentPhase::Ready, None)
                }
            }
        } else {
            (DeploymentPhase::Uninitialized, None)
        };

        info!(
            phase = %phase,
            root = %store.root().display(),
            policy = ?policy,
            "Lifecycle controller ready"
        );

        let (phase_tx, _) = watch::channel(phase);
        Arc::new(Self {
            store,
            runner,
            policy,
            state: Mutex::new(ControllerState {
                phase,
                committed,
                validated: None,
                running: None,
                last_attempts: HashMap::new(),
                last_error: None,
            }),
            phase_tx,
        })
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    pub fn phase(&self) -> DeploymentPhase {
        self.lock().phase
    }

    /// 订阅阶段变化
    pub fn subscribe_phase(&self) -> watch::Receiver<DeploymentPhase> {
        self.phase_tx.subscribe()
    }

    pub fn status(&self) -> DeploymentStatus {
        let state = self.lock();
        DeploymentStatus {
            phase: state.phase,
            switch_policy: self.policy,
            committed_snapshot: state.committed.clone(),
            validated_snapshot: state.validated.clone(),
            running: state.running.clone(),
            last_attempts: state
                .last_attempts
                .iter()
                .map(|(mode, attempt)| (mode.as_str(), AttemptSummary::from(attempt)))
                .collect(),
            last_error: state.last_error.clone(),
        }
    }

    /// 某模式最近一次构建尝试
    pub fn last_attempt(&self, mode: BuildMode) -> Option<BuildAttempt> {
        self.lock().last_attempts.get(&mode).cloned()
    }

    /// 取消正在运行的构建
    ///
    /// 返回被取消的操作；没有构建在运行时返回 None
    pub fn cancel_build(&self) -> Option<RunningOperation> {
        let state = self.lock();
        let running = state.running.as_ref()?;
        if !matches!(running.operation, Operation::Build(_)) {
            return None;
        }
        info!(operation = %running.operation, "Cancelling build");
        running.cancel.cancel();
        Some(running.clone())
    }

    /// 重置为最小骨架
    pub async fn init(self: &Arc<Self>, overwrite: bool) -> Result<ConfigurationFileSet, LifecycleError> {
        let permit = self.acquire(Operation::Init)?;
        let this = self.clone();

        run_detached(permit.cancel_token(), async move {
            let mut permit = permit;
            match this.store.init(overwrite).await {
                Ok(files) => {
                    let hash = files.snapshot_hash();
                    permit.finish(DeploymentPhase::Ready, |state| {
                        state.committed = Some(hash);
                        state.validated = None;
                        state.last_error = None;
                    });
                    Ok(files)
                }
                Err(e) => Err(this.store_failure(&mut permit, e)),
            }
        })
        .await
    }

    /// 整体替换配置文件集合
    pub async fn set_contents(self: &Arc<Self>, files: ConfigurationFileSet) -> Result<String, LifecycleError> {
        let permit = self.acquire(Operation::SetContents)?;
        let this = self.clone();

        run_detached(permit.cancel_token(), async move {
            let mut permit = permit;
            match this.store.set_contents(&files).await {
                Ok(()) => {
                    let hash = files.snapshot_hash();
                    info!(files = files.len(), snapshot = %hash, "Configuration files updated");
                    permit.finish(DeploymentPhase::Ready, |state| {
                        state.committed = Some(hash.clone());
                        state.validated = None;
                    });
                    Ok(hash)
                }
                Err(e) => Err(this.store_failure(&mut permit, e)),
            }
        })
        .await
    }

    /// 执行一次构建
    ///
    /// 构建工具非 0 退出返回 `Ok` 且 outcome 为 failed；调用方断开时构建被取消
    pub async fn run_build(self: &Arc<Self>, mode: BuildMode) -> Result<BuildAttempt, LifecycleError> {
        let permit = self.acquire(Operation::Build(mode))?;
        let this = self.clone();

        run_detached(permit.cancel_token(), async move {
            let mut permit = permit;
            this.execute_build(&mut permit, mode).await
        })
        .await
    }

    async fn execute_build(
        &self,
        permit: &mut SlotPermit,
        mode: BuildMode,
    ) -> Result<BuildAttempt, LifecycleError> {
        // 以磁盘上的实际内容作为快照
        let snapshot = self.store.get_contents().await?.snapshot_hash();

        if mode == BuildMode::Switch && self.policy == SwitchPolicy::RequireValidation {
            let validated = self.lock().validated.clone();
            if validated.as_deref() != Some(snapshot.as_str()) {
                return Err(ConcurrencyError::NotValidated.into());
            }
        }

        let attempt_id = uuid::Uuid::new_v4().to_string();
        let cancel = permit.begin(mode, &attempt_id);

        let attempt = match self.runner.run(&attempt_id, mode, &snapshot, cancel).await {
            Ok(attempt) => attempt,
            Err(e) => {
                let message = e.to_string();
                permit.finish(DeploymentPhase::Failed, |state| {
                    state.validated = None;
                    state.last_error = Some(message);
                });
                return Err(e.into());
            }
        };

        if attempt.succeeded() && mode == BuildMode::Switch {
            self.store.commit(&FileStore::commit_message()).await;
        }

        let next = if attempt.succeeded() {
            DeploymentPhase::completed_for(mode)
        } else {
            DeploymentPhase::Failed
        };
        let record = attempt.clone();
        permit.finish(next, move |state| {
            state.validated = match (record.succeeded(), mode) {
                (true, BuildMode::DryBuild | BuildMode::Test) => Some(record.snapshot.clone()),
                _ => None,
            };
            state.committed = Some(record.snapshot.clone());
            state.last_error = None;
            state.last_attempts.insert(mode, record);
        });

        Ok(attempt)
    }

    fn store_failure(&self, permit: &mut SlotPermit, e: StoreError) -> LifecycleError {
        if matches!(e, StoreError::PartialWrite(_)) || self.store.is_corrupt() {
            let message = e.to_string();
            permit.finish(DeploymentPhase::Corrupt, |state| {
                state.committed = None;
                state.validated = None;
                state.last_error = Some(message);
            });
        }
        e.into()
    }

    /// 占用构建槽位
    fn acquire(self: &Arc<Self>, operation: Operation) -> Result<SlotPermit, LifecycleError> {
        let mut state = self.lock();

        if let Some(running) = &state.running {
            let switching = running.operation == Operation::Build(BuildMode::Switch);
            return Err(match operation {
                Operation::SetContents | Operation::Init if switching => ConcurrencyError::Switching,
                _ => ConcurrencyError::Busy {
                    running: running.operation,
                },
            }
            .into());
        }

        let phase = state.phase;
        if phase == DeploymentPhase::Corrupt && operation != Operation::Init {
            return Err(StoreError::Corrupt.into());
        }

        if let Operation::Build(mode) = operation {
            if !phase.can_start(mode, self.policy) {
                if mode == BuildMode::Switch && self.policy == SwitchPolicy::RequireValidation {
                    return Err(ConcurrencyError::NotValidated.into());
                }
                return Err(ConcurrencyError::InvalidTransition {
                    from: phase,
                    operation,
                }
                .into());
            }
        }

        let cancel = CancellationToken::new();
        state.running = Some(RunningOperation {
            operation,
            attempt_id: None,
            started_at: Utc::now(),
            cancel: cancel.clone(),
        });

        Ok(SlotPermit {
            controller: self.clone(),
            cancel,
            phase_on_drop: None,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, phase: DeploymentPhase) {
        self.phase_tx.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }
}

/// 构建槽位许可
///
/// 释放时清空 running；构建已开始但未 `finish` 时阶段置为 failed
struct SlotPermit {
    controller: Arc<LifecycleController>,
    cancel: CancellationToken,
    phase_on_drop: Option<DeploymentPhase>,
}

impl SlotPermit {
    fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 进入构建中的阶段并广播
    fn begin(&mut self, mode: BuildMode, attempt_id: &str) -> CancellationToken {
        let phase = DeploymentPhase::active_for(mode);
        {
            let mut state = self.controller.lock();
            state.phase = phase;
            if let Some(running) = state.running.as_mut() {
                running.attempt_id = Some(attempt_id.to_string());
            }
        }
        self.phase_on_drop = Some(DeploymentPhase::Failed);
        self.controller.publish(phase);
        info!(mode = %mode, attempt_id, phase = %phase, "Build started");
        self.cancel.clone()
    }

    /// 以指定阶段结束操作
    fn finish(&mut self, phase: DeploymentPhase, update: impl FnOnce(&mut ControllerState)) {
        {
            let mut state = self.controller.lock();
            state.phase = phase;
            update(&mut state);
        }
        self.phase_on_drop = None;
        self.controller.publish(phase);
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let phase = {
            let mut state = self.controller.lock();
            state.running = None;
            if let Some(phase) = self.phase_on_drop.take() {
                warn!(phase = %phase, "Build slot released without completion");
                state.phase = phase;
                state.validated = None;
            }
            state.phase
        };
        self.controller.publish(phase);
    }
}

/// 在独立任务中执行持槽操作
///
/// 调用方 future 被丢弃时触发取消，任务本身会跑完并释放槽位，
/// 不会留下写了一半的目录交换
async fn run_detached<T, F>(cancel: CancellationToken, fut: F) -> Result<T, LifecycleError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, LifecycleError>> + Send + 'static,
{
    let guard = cancel.drop_guard();
    let result = tokio::spawn(fut).await;
    guard.disarm();
    result.map_err(|e| LifecycleError::Aborted(e.to_string()))?
}
