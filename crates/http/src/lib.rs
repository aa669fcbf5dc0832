//! argus-http - 可观测 HTTP 服务端与客户端
//!
//! axum 中间件与 reqwest 包装，为出入站 HTTP 请求自动附加
//! 日志、指标与 trace span，并在服务端恢复 handler panic

pub mod client;
pub mod middleware;
pub mod route;

pub use client::{Client, ClientOptions};
pub use middleware::{observe, recovery_layer, Options};
pub use route::{normalize_route, normalize_route_with};

use tracing::Level;

/// 根据响应状态码选择日志级别
///
/// >= 500 error，>= 400 warn，其余 info（可配置为 debug）
pub fn level_for_status(status: u16) -> Level {
    if status >= 500 {
        Level::ERROR
    } else if status >= 400 {
        Level::WARN
    } else {
        Level::INFO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for_status() {
        assert_eq!(level_for_status(500), Level::ERROR);
        assert_eq!(level_for_status(503), Level::ERROR);
        assert_eq!(level_for_status(599), Level::ERROR);
        assert_eq!(level_for_status(400), Level::WARN);
        assert_eq!(level_for_status(404), Level::WARN);
        assert_eq!(level_for_status(499), Level::WARN);
        assert_eq!(level_for_status(200), Level::INFO);
        assert_eq!(level_for_status(301), Level::INFO);
        assert_eq!(level_for_status(101), Level::INFO);
    }
}
