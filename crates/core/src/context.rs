//! 请求上下文类型
//!
//! 关联 ID 与调用方名称，通过 HTTP header / gRPC metadata 跨进程传播，
//! 并以请求扩展（extensions）的形式传递给下游 handler

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 关联 ID 的 HTTP header / gRPC metadata 键
pub const REQUEST_ID_HEADER: &str = "request-uuid";

/// 调用方名称的 HTTP header / gRPC metadata 键
pub const CLIENT_NAME_HEADER: &str = "client-name";

/// 请求关联 ID
///
/// 在请求边界创建，之后不再变更；进入请求处理后保证非空
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// 调用方声明的客户端名称
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From)]
#[display("{_0}")]
pub struct ClientName(pub String);

impl ClientName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
