//! HTTP 中间件

pub mod auth;

pub use auth::RequireApiKey;
