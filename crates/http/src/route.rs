//! 路由标签归一化
//!
//! metrics 标签必须保持低基数：把路径中的 uuid 和纯数字段替换为 :id

use once_cell::sync::Lazy;
use regex::Regex;

/// uuid 形式的路径段
static UUID_SEGMENT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$")
        .unwrap()
});

/// 纯数字的路径段
static NUMERIC_SEGMENT_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());

/// 将请求路径归一化为路由标签
pub fn normalize_route(path: &str) -> String {
    normalize_route_with(path, None)
}

/// 使用调用方提供的 id 段模式归一化路径
///
/// 提供模式时它整体替代默认的 uuid / 数字判定
pub fn normalize_route_with(path: &str, id_pattern: Option<&Regex>) -> String {
    path.split('/')
        .map(|segment| {
            let is_id = match id_pattern {
                Some(pattern) => pattern.is_match(segment),
                None => {
                    UUID_SEGMENT_REGEX.is_match(segment)
                        || NUMERIC_SEGMENT_REGEX.is_match(segment)
                }
            };
            if is_id {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
