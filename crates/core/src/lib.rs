//! argus-core - 可观测性核心库
//!
//! 将 logger、meter、tracer 三大支柱统一在一个 Observer 中，
//! 供 HTTP 中间件与 gRPC 拦截层复用

pub mod config;
pub mod context;
pub mod error;
pub mod observer;
pub mod propagation;

pub use config::*;
pub use context::*;
pub use error::*;
pub use observer::Observer;
pub use propagation::{extract_context, inject_context};
