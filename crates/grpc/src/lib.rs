//! argus-grpc - 可观测 gRPC 服务端与客户端
//!
//! 基于 tower Layer 的观测层：服务端层挂在 tonic Server 上，
//! 客户端层包装 Channel。每次调用自动传播关联 ID、开启 span、
//! 记录指标与结构化日志，服务端层同时恢复 handler panic

pub mod client;
pub mod endpoint;
pub mod server;

pub use client::{ClientObserve, ClientObserveLayer};
pub use endpoint::Endpoint;
pub use server::{ServerObserve, ServerObserveLayer};

use http::HeaderMap;

/// 观测层可选配置
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// 成功调用记录在 debug 级别（默认 info）
    pub log_at_debug: bool,
    /// 不观测的方法名（如健康检查）
    pub excluded_methods: Vec<String>,
}

impl Options {
    pub fn is_excluded(&self, method: &str) -> bool {
        self.excluded_methods.iter().any(|m| m == method)
    }
}

/// 从响应头读取 grpc-status
///
/// 正常响应的状态码在 trailer 中，头部缺失视为成功；
/// trailers-only 错误响应会把状态码直接放进头部
pub(crate) fn grpc_status(headers: &HeaderMap) -> i32 {
    headers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_is_excluded() {
        let opts = Options {
            excluded_methods: vec!["Check".to_string(), "Watch".to_string()],
            ..Options::default()
        };
        assert!(opts.is_excluded("Check"));
        assert!(opts.is_excluded("Watch"));
        assert!(!opts.is_excluded("GetItem"));
    }

    #[test]
    fn test_grpc_status_absent_is_ok() {
        assert_eq!(grpc_status(&HeaderMap::new()), 0);
    }

    #[test]
    fn test_grpc_status_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("13"));
        assert_eq!(grpc_status(&headers), 13);
    }
}
