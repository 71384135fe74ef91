//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use tracing::warn;

use crate::domain::lifecycle::SwitchPolicy;
use crate::domain::liveness::LivenessProbe;
use crate::domain::shell::ShellConfig;

use constants::{
    DEFAULT_BUILD_TIMEOUT_SECS, DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_LIVENESS_INTERVAL_SECS,
    DEFAULT_LIVENESS_TIMEOUT_SECS, DEFAULT_SEARCH_TIMEOUT_SECS, MAX_FETCH_BODY_BYTES,
};

/// 默认构建参数模板
pub const DEFAULT_BUILD_ARGS: &str = "{mode} -I nixos-config={config_root}/configuration.nix";

/// 默认包搜索参数模板
pub const DEFAULT_SEARCH_ARGS: &str = "search nixpkgs {query}";

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥（未设置时不校验）
    pub api_key: Option<String>,
    /// 服务监听端口
    pub port: u16,
    /// 配置目录
    pub store: StoreConfig,
    /// 构建工具
    pub build: BuildConfig,
    /// 存活检测
    pub liveness: LivenessConfig,
    /// 本地 URL 代理
    pub fetch: FetchConfig,
    /// 远程 shell 通道
    pub shell: ShellConfig,
    /// 包搜索
    pub search: SearchConfig,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        // API Key - 支持旧名称兼容
        let api_key = load_with_fallback("DEPLOY_AGENT_API_KEY", "API_KEY").filter(|k| !k.is_empty());
        if env::var("API_KEY").is_ok() {
            warn!("Deprecated environment variable API_KEY detected. Please use DEPLOY_AGENT_API_KEY");
        }
        if api_key.is_none() {
            warn!("DEPLOY_AGENT_API_KEY is not set, control endpoints are unauthenticated");
        }

        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9876);

        Self {
            api_key,
            port,
            store: StoreConfig::from_env(),
            build: BuildConfig::from_env(),
            liveness: LivenessConfig::from_env(),
            fetch: FetchConfig::from_env(),
            shell: ShellConfig::from_env(),
            search: SearchConfig::from_env(),
        }
    }
}

/// 配置目录配置
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// 配置根目录（默认 /etc/nixos）
    pub root: PathBuf,
    /// 是否用 git 记录每次 switch
    pub git_versioning: bool,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            git_versioning: false,
        }
    }

    pub fn from_env() -> Self {
        let root = env::var("NIX_CONFIG_DIR").unwrap_or_else(|_| "/etc/nixos".to_string());
        let git_versioning = env::var("NIX_CONFIG_GIT")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            root: PathBuf::from(root),
            git_versioning,
        }
    }
}

/// 构建工具配置
#[derive(Clone, Debug)]
pub struct BuildConfig {
    /// 构建程序（默认 nixos-rebuild）
    pub program: String,
    /// 参数模板，支持 `{mode}` 和 `{config_root}` 占位符
    pub args: Vec<String>,
    /// 单次构建超时（秒）
    pub timeout_secs: u64,
    /// switch 前置条件策略
    pub switch_policy: SwitchPolicy,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            program: "nixos-rebuild".to_string(),
            args: split_args(DEFAULT_BUILD_ARGS),
            timeout_secs: DEFAULT_BUILD_TIMEOUT_SECS,
            switch_policy: SwitchPolicy::RequireValidation,
        }
    }
}

impl BuildConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let program = env::var("BUILD_PROGRAM").unwrap_or(defaults.program);
        let args = env::var("BUILD_ARGS")
            .map(|v| split_args(&v))
            .unwrap_or(defaults.args);
        let timeout_secs = env::var("BUILD_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.timeout_secs);
        let switch_policy = env::var("SWITCH_POLICY")
            .map(|v| SwitchPolicy::from_str(&v))
            .unwrap_or_default();

        if !args.iter().any(|a| a.contains("{mode}")) {
            warn!(args = ?args, "BUILD_ARGS has no {{mode}} placeholder, all build modes run the same command");
        }

        Self {
            program,
            args,
            timeout_secs,
            switch_policy,
        }
    }
}

/// 存活检测配置
#[derive(Clone, Debug)]
pub struct LivenessConfig {
    pub probe: LivenessProbe,
    /// 后台检测间隔（秒），0 表示只按需检测
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe: LivenessProbe::default(),
            interval_secs: DEFAULT_LIVENESS_INTERVAL_SECS,
            timeout_secs: DEFAULT_LIVENESS_TIMEOUT_SECS,
        }
    }
}

impl LivenessConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let probe = match env::var("LIVENESS_PROBE") {
            Ok(v) => LivenessProbe::parse(&v).unwrap_or_else(|| {
                warn!(value = %v, "Invalid LIVENESS_PROBE, using default");
                LivenessProbe::default()
            }),
            Err(_) => defaults.probe,
        };
        let interval_secs = env::var("LIVENESS_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.interval_secs);
        let timeout_secs = env::var("LIVENESS_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.timeout_secs);

        Self {
            probe,
            interval_secs,
            timeout_secs,
        }
    }
}

/// 本地 URL 代理配置
#[derive(Clone, Debug)]
pub struct FetchConfig {
    /// 只允许 localhost / 回环地址
    pub local_only: bool,
    pub timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            local_only: true,
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            max_body_bytes: MAX_FETCH_BODY_BYTES,
        }
    }
}

impl FetchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let local_only = env::var("FETCH_LOCAL_ONLY")
            .ok()
            .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
            .unwrap_or(defaults.local_only);
        let timeout_secs = env::var("FETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.timeout_secs);
        let max_body_bytes = env::var("FETCH_MAX_BODY_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_body_bytes);

        Self {
            local_only,
            timeout_secs,
            max_body_bytes,
        }
    }
}

/// 包搜索配置
#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// 搜索程序（默认 nix）
    pub program: String,
    /// 参数模板，支持 `{query}` 占位符
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            program: "nix".to_string(),
            args: split_args(DEFAULT_SEARCH_ARGS),
            timeout_secs: DEFAULT_SEARCH_TIMEOUT_SECS,
        }
    }
}

impl SearchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let program = env::var("SEARCH_PROGRAM").unwrap_or(defaults.program);
        let args = env::var("SEARCH_ARGS")
            .map(|v| split_args(&v))
            .unwrap_or(defaults.args);
        let timeout_secs = env::var("SEARCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.timeout_secs);

        Self {
            program,
            args,
            timeout_secs,
        }
    }
}

/// 按空白拆分参数模板
fn split_args(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

/// 常量
pub mod constants {
    /// 构建超时（秒）
    pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    /// 存活检测间隔（秒）
    pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 60;

    /// 存活检测超时（秒）
    pub const DEFAULT_LIVENESS_TIMEOUT_SECS: u64 = 5;

    /// 本地 URL 代理超时（秒）
    pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

    /// 包搜索超时（秒）
    pub const DEFAULT_SEARCH_TIMEOUT_SECS: u64 = 60;

    /// 本地 URL 代理响应体上限
    pub const MAX_FETCH_BODY_BYTES: usize = 10 * 1024 * 1024;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
