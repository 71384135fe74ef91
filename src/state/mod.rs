//! 运行时状态模块
//!
//! 管理应用状态和构建日志通道

pub mod app_state;
pub mod log_hub;

pub use app_state::{get_shutdown_token, trigger_shutdown, AppState};
pub use log_hub::LogHub;
