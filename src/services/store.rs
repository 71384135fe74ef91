//! 配置文件存储
//!
//! 配置根目录是文件集合的唯一权威来源。整体替换通过兄弟目录 staging + rename
//! 完成。两次 rename 之间根目录短暂不存在，所以交换持有 `swap_lock` 写锁，
//! 读取在整个遍历期间持有读锁，读者只能看到完整的旧集合或完整的新集合。

use chrono::Utc;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::domain::fileset::{ConfigurationFileSet, PathError, ENTRY_POINT, RESERVED_DIR};
use crate::infra::CommandRunner;

/// git 命令超时
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// 存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration root {path} is not writable: {source}")]
    NotWritable {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("configuration root already contains {count} file(s); set overwrite to replace them")]
    NotEmpty { count: usize },

    #[error(transparent)]
    InvalidPath(#[from] PathError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("configuration root left partially written: {0}")]
    PartialWrite(String),

    #[error("configuration store is corrupt, re-run init")]
    Corrupt,
}

fn io_err(context: impl Into<String>) -> impl FnOnce(io::Error) -> StoreError {
    let context = context.into();
    move |source| StoreError::Io { context, source }
}

/// 配置文件存储
pub struct FileStore {
    root: PathBuf,
    git_versioning: bool,
    corrupt: AtomicBool,
    swap_lock: RwLock<()>,
    #[cfg(test)]
    fail_swap: AtomicBool,
}

impl FileStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            root: config.root.clone(),
            git_versioning: config.git_versioning,
            corrupt: AtomicBool::new(false),
            swap_lock: RwLock::new(()),
            #[cfg(test)]
            fail_swap: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 是否处于损坏状态（需要重新 init）
    pub fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::SeqCst)
    }

    /// 配置根目录中是否已有入口文件
    pub fn has_entry_point(&self) -> bool {
        self.root.join(ENTRY_POINT).is_file()
    }

    /// 重置为最小骨架
    ///
    /// 已有文件且未确认覆盖时拒绝执行
    pub async fn init(&self, overwrite: bool) -> Result<ConfigurationFileSet, StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::NotWritable {
                path: self.root.display().to_string(),
                source,
            })?;

        let _guard = self.swap_lock.write().await;
        let existing = self.list_unlocked().await?;
        if !existing.is_empty() && !overwrite {
            return Err(StoreError::NotEmpty {
                count: existing.len(),
            });
        }

        let skeleton = ConfigurationFileSet::skeleton();
        self.replace(&skeleton).await?;
        self.corrupt.store(false, Ordering::SeqCst);

        if self.git_versioning {
            self.git_init().await;
        }

        info!(
            root = %self.root.display(),
            replaced = existing.len(),
            "Configuration root initialized"
        );
        Ok(skeleton)
    }

    /// 列出所有文件（相对路径，字典序，不含 .git）
    pub async fn list_files(&self) -> Result<Vec<String>, StoreError> {
        let _guard = self.swap_lock.read().await;
        self.list_unlocked().await
    }

    async fn list_unlocked(&self) -> Result<Vec<String>, StoreError> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(io_err(format!("failed to read {}", dir.display())))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(io_err(format!("failed to read {}", dir.display())))?
            {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    warn!(path = %entry.path().display(), "Skipping non UTF-8 file name");
                    continue;
                };
                if prefix.is_empty() && name == RESERVED_DIR {
                    continue;
                }

                let relative = if prefix.is_empty() {
                    name
                } else {
                    format!("{}/{}", prefix, name)
                };
                // 跟随符号链接判断类型
                let metadata = match fs::metadata(entry.path()).await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(path = %relative, error = %e, "Skipping unreadable entry");
                        continue;
                    }
                };
                if metadata.is_dir() {
                    pending.push((entry.path(), relative));
                } else if metadata.is_file() {
                    files.push(relative);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// 读取完整文件集合
    pub async fn get_contents(&self) -> Result<ConfigurationFileSet, StoreError> {
        let _guard = self.swap_lock.read().await;
        let mut files = BTreeMap::new();
        for path in self.list_unlocked().await? {
            let bytes = fs::read(self.root.join(&path))
                .await
                .map_err(io_err(format!("failed to read {}", path)))?;
            let content = match String::from_utf8(bytes) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path, "File is not valid UTF-8, returning lossy text");
                    String::from_utf8_lossy(e.as_bytes()).into_owned()
                }
            };
            files.insert(path, content);
        }
        Ok(ConfigurationFileSet::from_map(files)?)
    }

    /// 原子整体替换文件集合
    pub async fn set_contents(&self, files: &ConfigurationFileSet) -> Result<(), StoreError> {
        if self.is_corrupt() {
            return Err(StoreError::Corrupt);
        }
        files.validate()?;
        let _guard = self.swap_lock.write().await;
        self.replace(files).await?;
        debug!(count = files.len(), "Configuration files replaced");
        Ok(())
    }

    /// 提交当前配置到 git（失败只记录日志）
    pub async fn commit(&self, message: &str) {
        if !self.git_versioning {
            return;
        }

        for args in [
            vec!["add", "-A"],
            vec![
                "-c",
                "user.name=nix-deploy-agent",
                "-c",
                "user.email=nix-deploy-agent@localhost",
                "commit",
                "--allow-empty",
                "-m",
                message,
            ],
        ] {
            match CommandRunner::run_simple("git", &args, &self.root, GIT_TIMEOUT).await {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    warn!(
                        command = %args.join(" "),
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "git command failed"
                    );
                    return;
                }
                Err(e) => {
                    warn!(command = %args.join(" "), error = %e, "Failed to run git");
                    return;
                }
            }
        }
        info!(commit = %message, "Configuration committed to git");
    }

    /// 默认的提交说明
    pub fn commit_message() -> String {
        format!("Configuration updated at {}", Utc::now().to_rfc3339())
    }

    async fn git_init(&self) {
        match CommandRunner::run_simple("git", &["init"], &self.root, GIT_TIMEOUT).await {
            Ok(output) if output.status.success() => {
                debug!(root = %self.root.display(), "git repository initialized");
            }
            Ok(output) => warn!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "git init failed"
            ),
            Err(e) => warn!(error = %e, "Failed to run git init"),
        }
    }

    fn sibling(&self, tag: &str) -> Result<PathBuf, StoreError> {
        let parent = self.root.parent().ok_or_else(|| StoreError::NotWritable {
            path: self.root.display().to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "root has no parent directory"),
        })?;
        let name = self
            .root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("config");
        Ok(parent.join(format!(".{}.{}-{}", name, tag, uuid::Uuid::new_v4())))
    }

    /// staging 写入 + 目录交换
    ///
    /// 交换失败时回滚；回滚也失败则标记为损坏。调用方持有 `swap_lock` 写锁
    async fn replace(&self, files: &ConfigurationFileSet) -> Result<(), StoreError> {
        let staging = self.sibling("staging")?;
        let backup = self.sibling("backup")?;

        if let Err(e) = write_tree(&staging, files).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        let root_exists = fs::try_exists(&self.root).await.unwrap_or(false);
        let git_dir = self.root.join(RESERVED_DIR);
        let staged_git = staging.join(RESERVED_DIR);
        let carry_git = root_exists && fs::try_exists(&git_dir).await.unwrap_or(false);

        // .git 不属于文件集合，随目录一起搬到新树
        if carry_git {
            if let Err(e) = fs::rename(&git_dir, &staged_git).await {
                let _ = fs::remove_dir_all(&staging).await;
                return Err(io_err("failed to carry .git into staging")(e));
            }
        }

        if root_exists {
            if let Err(e) = fs::rename(&self.root, &backup).await {
                if carry_git {
                    let _ = fs::rename(&staged_git, &git_dir).await;
                }
                let _ = fs::remove_dir_all(&staging).await;
                return Err(io_err("failed to move configuration root aside")(e));
            }
        }

        if let Err(e) = self.swap_rename(&staging, &self.root).await {
            error!(error = %e, "Failed to swap staging directory into place, rolling back");
            return Err(self.rollback(root_exists, carry_git, &staging, &backup, e).await);
        }

        if root_exists {
            if let Err(e) = fs::remove_dir_all(&backup).await {
                warn!(path = %backup.display(), error = %e, "Failed to remove backup directory");
            }
        }
        Ok(())
    }

    async fn rollback(
        &self,
        root_exists: bool,
        carry_git: bool,
        staging: &Path,
        backup: &Path,
        cause: io::Error,
    ) -> StoreError {
        let restored = if root_exists {
            self.swap_rename(backup, &self.root).await
        } else {
            Ok(())
        };

        match restored {
            Ok(()) => {
                if carry_git {
                    let _ = fs::rename(staging.join(RESERVED_DIR), self.root.join(RESERVED_DIR)).await;
                }
                let _ = fs::remove_dir_all(staging).await;
                io_err("failed to swap configuration directory")(cause)
            }
            Err(e) => {
                self.corrupt.store(true, Ordering::SeqCst);
                error!(
                    root = %self.root.display(),
                    backup = %backup.display(),
                    error = %e,
                    "Rollback failed, configuration store marked corrupt"
                );
                StoreError::PartialWrite(format!(
                    "swap failed ({}) and rollback failed ({}); previous files kept at {}",
                    cause,
                    e,
                    backup.display()
                ))
            }
        }
    }

    /// 把目录放回根位置的 rename
    async fn swap_rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        #[cfg(test)]
        if self.fail_swap.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "rename disabled for test"));
        }
        fs::rename(from, to).await
    }

    #[cfg(test)]
    pub(crate) fn mark_corrupt(&self) {
        self.corrupt.store(true, Ordering::SeqCst);
    }

    /// 让交换和回滚的 rename 失败
    #[cfg(test)]
    pub(crate) fn fail_swaps(&self, on: bool) {
        self.fail_swap.store(on, Ordering::SeqCst);
    }
}

async fn write_tree(dir: &Path, files: &ConfigurationFileSet) -> Result<(), StoreError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| StoreError::NotWritable {
            path: dir.display().to_string(),
            source,
        })?;

    for (path, content) in files.iter() {
        let target = dir.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(io_err(format!("failed to create directory for {}", path)))?;
        }
        fs::write(&target, content)
            .await
            .map_err(io_err(format!("failed to write {}", path)))?;
    }
    Ok(())
}
