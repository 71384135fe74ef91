//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod builder;
pub mod fetch;
pub mod lifecycle;
pub mod liveness;
pub mod search;
pub mod shell;
pub mod store;

pub use builder::{BuildRunner, RunnerError};
pub use fetch::{FetchError, RemoteFetchProxy};
pub use lifecycle::{ConcurrencyError, LifecycleController, LifecycleError};
pub use liveness::LivenessMonitor;
pub use search::{PackageSearch, SearchError};
pub use shell::{ShellTunnel, TunnelError};
pub use store::{FileStore, StoreError};
