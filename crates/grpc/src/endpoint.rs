//! gRPC endpoint 解析
//!
//! 请求路径形如 /package.Service/Method，拆出低基数的指标标签

use std::fmt;

/// 解析后的 gRPC endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub package: String,
    pub service: String,
    pub method: String,
}

impl Endpoint {
    /// 从请求路径解析 endpoint
    ///
    /// 包名可以包含点号，最后一个点号之后的部分是服务名。
    /// 不符合 /package.Service/Method 形式的路径返回 None
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.strip_prefix('/')?;
        let (qualified, method) = path.split_once('/')?;
        let (package, service) = qualified.rsplit_once('.')?;

        if package.is_empty() || service.is_empty() || method.is_empty() || method.contains('/') {
            return None;
        }

        Some(Self {
            package: package.to_string(),
            service: service.to_string(),
            method: method.to_string(),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.package, self.service, self.method)
    }
}
